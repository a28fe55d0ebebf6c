use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, OcraResult};

/// RGBA color with 8-bit components
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Debug)]
pub struct Color {
    pub(crate) r: u8,
    pub(crate) g: u8,
    pub(crate) b: u8,
    pub(crate) a: u8,
}

fn parse_hex_component(hex: &str, original: &str) -> OcraResult<u8> {
    u8::from_str_radix(hex, 16).map_err(|_| Error::InvalidHexColor {
        value: original.to_string(),
        reason: format!("invalid hex component '{}'", hex),
    })
}

impl Color {
    pub(crate) const WHITE: Color = Color {
        r: 255,
        g: 255,
        b: 255,
        a: 255,
    };
    pub(crate) const BLACK: Color = Color {
        r: 0,
        g: 0,
        b: 0,
        a: 255,
    };

    // #333333 / #fffffe
    pub(crate) const LIGHT_FG_FALLBACK: Color = Color {
        r: 51,
        g: 51,
        b: 51,
        a: 255,
    };
    pub(crate) const LIGHT_BG_FALLBACK: Color = Color {
        r: 255,
        g: 255,
        b: 254,
        a: 255,
    };
    // #bbbbbb / #1e1e1e
    pub(crate) const DARK_FG_FALLBACK: Color = Color {
        r: 187,
        g: 187,
        b: 187,
        a: 255,
    };
    pub(crate) const DARK_BG_FALLBACK: Color = Color {
        r: 30,
        g: 30,
        b: 30,
        a: 255,
    };

    /// Outputs the hex value for that colour.
    #[inline]
    pub fn as_hex(&self) -> String {
        if self.a < 255 {
            format!("#{:02X}{:02X}{:02X}{:02X}", self.r, self.g, self.b, self.a)
        } else {
            format!("#{:02X}{:02X}{:02X}", self.r, self.g, self.b)
        }
    }

    /// Creates a Color from a string (in theory a hex but it can also be black/white).
    ///
    /// Errors if the string is not a valid hex colour.
    pub fn from_hex(hex: &str) -> OcraResult<Self> {
        let original = hex;
        let hex = hex.trim_start_matches('#');

        if hex == "white" {
            return Ok(Color::WHITE);
        } else if hex == "black" {
            return Ok(Color::BLACK);
        }
        // Parse based on length
        match hex.len() {
            // #RGB format (e.g., #F00 for red)
            3 => {
                let r = parse_hex_component(&hex[0..1], original)?;
                let g = parse_hex_component(&hex[1..2], original)?;
                let b = parse_hex_component(&hex[2..3], original)?;
                Ok(Color {
                    r: r * 17, // Convert 0xF to 0xFF
                    g: g * 17,
                    b: b * 17,
                    a: 255,
                })
            }
            // #RGBA format (e.g., #F00F for red with full opacity)
            4 => {
                let r = parse_hex_component(&hex[0..1], original)?;
                let g = parse_hex_component(&hex[1..2], original)?;
                let b = parse_hex_component(&hex[2..3], original)?;
                let a = parse_hex_component(&hex[3..4], original)?;
                Ok(Color {
                    r: r * 17,
                    g: g * 17,
                    b: b * 17,
                    a: a * 17,
                })
            }
            // #RRGGBB format (e.g., #FF0000 for red)
            6 => {
                let r = parse_hex_component(&hex[0..2], original)?;
                let g = parse_hex_component(&hex[2..4], original)?;
                let b = parse_hex_component(&hex[4..6], original)?;
                Ok(Color { r, g, b, a: 255 })
            }
            // #RRGGBBAA format (e.g., #FF0000FF for red with full opacity)
            8 => {
                let r = parse_hex_component(&hex[0..2], original)?;
                let g = parse_hex_component(&hex[2..4], original)?;
                let b = parse_hex_component(&hex[4..6], original)?;
                let a = parse_hex_component(&hex[6..8], original)?;
                Ok(Color { r, g, b, a })
            }
            _ => Err(Error::InvalidHexColor {
                value: original.to_string(),
                reason: format!("invalid length {}", hex.len()),
            }),
        }
    }
}

/// Maps colors to small integer ids used in packed token metadata.
/// Id 0 is reserved for "no color set".
#[derive(Debug, Clone, Default)]
pub struct ColorMap {
    colors: Vec<Color>,
    ids: HashMap<Color, u32>,
    /// A frozen map comes from a precompiled theme: every color a rule can
    /// reference must already be present.
    frozen: bool,
}

impl ColorMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a map with a fixed id assignment (index + 1).
    pub fn frozen(colors: Vec<Color>) -> Self {
        let ids = colors
            .iter()
            .enumerate()
            .map(|(i, &c)| (c, i as u32 + 1))
            .collect();
        Self {
            colors,
            ids,
            frozen: true,
        }
    }

    pub fn id_of(&mut self, color: Color) -> OcraResult<u32> {
        if let Some(&id) = self.ids.get(&color) {
            return Ok(id);
        }
        if self.frozen {
            return Err(Error::ColorNotInMap(color.as_hex()));
        }
        self.colors.push(color);
        let id = self.colors.len() as u32;
        self.ids.insert(color, id);
        Ok(id)
    }

    pub fn color(&self, id: u32) -> Option<Color> {
        if id == 0 {
            return None;
        }
        self.colors.get(id as usize - 1).copied()
    }

    pub fn colors(&self) -> &[Color] {
        &self.colors
    }
}
