use std::collections::HashMap;

use crate::error::OcraResult;
use crate::scope::Scope;
use crate::themes::color::{Color, ColorMap};
use crate::themes::font_style::FontStyle;
use crate::themes::raw::{RawTheme, TokenColorSettings};
use crate::themes::selector::{ThemeSelector, parse_selector};
use crate::themes::trie::ThemeTrie;

/// Whether a theme targets a light or dark background. Picks the fallback
/// editor colors when the theme itself doesn't provide them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThemeType {
    Light,
    #[default]
    Dark,
}

impl ThemeType {
    fn from_raw(type_: Option<&str>) -> Self {
        match type_ {
            Some("light") => ThemeType::Light,
            _ => ThemeType::Dark,
        }
    }

    pub(crate) fn default_foreground(self) -> Color {
        match self {
            ThemeType::Light => Color::LIGHT_FG_FALLBACK,
            ThemeType::Dark => Color::DARK_FG_FALLBACK,
        }
    }

    pub(crate) fn default_background(self) -> Color {
        match self {
            ThemeType::Light => Color::LIGHT_BG_FALLBACK,
            ThemeType::Dark => Color::DARK_BG_FALLBACK,
        }
    }
}

/// A partial style as written in a theme rule: only the fields the rule
/// actually sets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StyleModifier {
    pub foreground: Option<Color>,
    pub background: Option<Color>,
    pub font_style: Option<FontStyle>,
}

impl StyleModifier {
    fn from_settings(settings: &TokenColorSettings) -> OcraResult<Self> {
        let foreground = settings.foreground().map(Color::from_hex).transpose()?;
        let background = settings.background().map(Color::from_hex).transpose()?;
        let font_style = settings
            .font_style
            .as_deref()
            .map(|s| FontStyle::from_str(s));
        Ok(Self {
            foreground,
            background,
            font_style,
        })
    }
}

/// A fully resolved style with concrete colors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Style {
    pub foreground: Color,
    pub background: Color,
    pub font_style: FontStyle,
}

/// A resolved style in color-map id form, as packed into token metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedStyle {
    pub font_style: FontStyle,
    pub foreground: u32,
    pub background: u32,
}

struct ParsedRule {
    selector: ThemeSelector,
    font_style: Option<FontStyle>,
    foreground: u32,
    background: u32,
    order: u32,
}

/// A theme compiled for fast scope stack lookups.
#[derive(Debug, Clone)]
pub struct CompiledTheme {
    pub name: String,
    pub theme_type: ThemeType,
    trie: ThemeTrie,
    color_map: ColorMap,
    default_foreground_id: u32,
    default_background_id: u32,
}

impl CompiledTheme {
    pub fn from_raw_theme(raw: RawTheme) -> OcraResult<Self> {
        Self::compile(raw, ColorMap::new())
    }

    /// Compiles against a fixed color list taken from a previously compiled
    /// theme, so ids stay compatible with token metadata produced earlier.
    /// A color the theme uses that is missing from the list is a fatal
    /// [`Error::ColorNotInMap`](crate::Error::ColorNotInMap).
    pub fn from_raw_theme_with_colors(raw: RawTheme, colors: Vec<Color>) -> OcraResult<Self> {
        Self::compile(raw, ColorMap::frozen(colors))
    }

    fn compile(raw: RawTheme, mut color_map: ColorMap) -> OcraResult<Self> {
        let theme_type = ThemeType::from_raw(raw.type_.as_deref());
        let default_foreground = Color::from_hex(&raw.colors.foreground)
            .unwrap_or_else(|_| theme_type.default_foreground());
        let default_background = Color::from_hex(&raw.colors.background)
            .unwrap_or_else(|_| theme_type.default_background());

        let default_foreground_id = color_map.id_of(default_foreground)?;
        let default_background_id = color_map.id_of(default_background)?;

        let mut parsed = Vec::new();
        for (order, rule) in raw.token_colors.iter().enumerate() {
            let modifier = StyleModifier::from_settings(&rule.settings)?;
            let foreground = match modifier.foreground {
                Some(c) => color_map.id_of(c)?,
                None => 0,
            };
            let background = match modifier.background {
                Some(c) => color_map.id_of(c)?,
                None => 0,
            };

            // a single entry can hold several comma-separated selectors
            for scope in &rule.scope {
                for part in scope.split(',') {
                    if let Some(selector) = parse_selector(part) {
                        parsed.push(ParsedRule {
                            selector,
                            font_style: modifier.font_style,
                            foreground,
                            background,
                            order: order as u32,
                        });
                    }
                }
            }
        }

        // Ancestors have to reach the trie before their descendants so cloned
        // children pick them up; Scope's atom packing makes that a plain sort.
        parsed.sort_by_key(|r| r.selector.target_scope);

        let mut trie = ThemeTrie::default();
        for rule in &parsed {
            trie.insert(
                rule.selector.target_scope,
                &rule.selector.parent_scopes,
                rule.font_style,
                rule.foreground,
                rule.background,
                rule.order,
            );
        }

        Ok(Self {
            name: raw.name,
            theme_type,
            trie,
            color_map,
            default_foreground_id,
            default_background_id,
        })
    }

    /// The editor-wide style applied where no rule matches.
    pub fn default_style(&self) -> Style {
        Style {
            foreground: self
                .color_map
                .color(self.default_foreground_id)
                .unwrap_or(self.theme_type.default_foreground()),
            background: self
                .color_map
                .color(self.default_background_id)
                .unwrap_or(self.theme_type.default_background()),
            font_style: FontStyle::empty(),
        }
    }

    pub fn color_map(&self) -> &ColorMap {
        &self.color_map
    }

    /// Creates a matcher holding a memo of resolved scope stacks.
    pub fn matcher(&self) -> ThemeMatcher<'_> {
        ThemeMatcher {
            theme: self,
            cache: HashMap::new(),
        }
    }
}

/// Resolves scope stacks against one theme, memoizing by full stack since
/// the same stacks come up over and over within a file.
#[derive(Debug)]
pub struct ThemeMatcher<'t> {
    theme: &'t CompiledTheme,
    cache: HashMap<Vec<Scope>, ResolvedStyle>,
}

impl ThemeMatcher<'_> {
    /// Resolves a scope stack (outermost first) to color map ids and a font
    /// style. Inner scopes override the fields they set; everything else is
    /// inherited from the scopes beneath them.
    pub fn resolve(&mut self, scopes: &[Scope]) -> ResolvedStyle {
        if let Some(style) = self.cache.get(scopes) {
            return *style;
        }

        let mut resolved = ResolvedStyle {
            font_style: FontStyle::empty(),
            foreground: self.theme.default_foreground_id,
            background: self.theme.default_background_id,
        };

        for i in 0..scopes.len() {
            if let Some(rule) = self.theme.trie.match_scope(scopes[i], &scopes[..i]) {
                if let Some(font_style) = rule.font_style {
                    resolved.font_style = font_style;
                }
                if rule.foreground != 0 {
                    resolved.foreground = rule.foreground;
                }
                if rule.background != 0 {
                    resolved.background = rule.background;
                }
            }
        }

        self.cache.insert(scopes.to_vec(), resolved);
        resolved
    }

    /// Like [`resolve`](Self::resolve) but with ids swapped for actual colors.
    pub fn style(&mut self, scopes: &[Scope]) -> Style {
        let resolved = self.resolve(scopes);
        let default = self.theme.default_style();
        Style {
            foreground: self
                .theme
                .color_map
                .color(resolved.foreground)
                .unwrap_or(default.foreground),
            background: self
                .theme
                .color_map
                .color(resolved.background)
                .unwrap_or(default.background),
            font_style: resolved.font_style,
        }
    }
}
