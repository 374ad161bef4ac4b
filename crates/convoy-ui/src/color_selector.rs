use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use console::{Style, StyledObject};

/// Round-robins a fixed palette across task ids so each task keeps a stable
/// prefix color for the whole run.
#[derive(Debug, Clone, Default)]
pub struct ColorSelector {
    inner: Arc<RwLock<ColorSelectorState>>,
}

#[derive(Debug, Default)]
struct ColorSelectorState {
    idx: usize,
    cache: HashMap<String, Style>,
}

fn palette() -> [Style; 5] {
    [
        Style::new().cyan(),
        Style::new().magenta(),
        Style::new().green(),
        Style::new().yellow(),
        Style::new().blue(),
    ]
}

impl ColorSelector {
    pub fn color_for_key(&self, key: &str) -> Style {
        if let Some(style) = self
            .inner
            .read()
            .expect("color selector lock poisoned")
            .cache
            .get(key)
        {
            return style.clone();
        }

        let mut state = self.inner.write().expect("color selector lock poisoned");
        let colors = palette();
        let style = colors[state.idx % colors.len()].clone();
        state.idx += 1;
        state.cache.insert(key.to_string(), style.clone());
        style
    }

    pub fn prefix_with_color(&self, key: &str, prefix: &str) -> StyledObject<String> {
        if prefix.is_empty() {
            return Style::new().apply_to(String::new());
        }
        let style = self.color_for_key(key);
        style.apply_to(format!("{prefix}: "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_color_is_stable_per_key() {
        let selector = ColorSelector::default();
        let first = selector.color_for_key("app#build");
        let second = selector.color_for_key("app#build");
        assert_eq!(format!("{:?}", first), format!("{:?}", second));
    }

    #[test]
    fn test_colors_rotate() {
        let selector = ColorSelector::default();
        let a = selector.color_for_key("a");
        let b = selector.color_for_key("b");
        assert_ne!(format!("{:?}", a), format!("{:?}", b));
    }

    #[test]
    fn test_empty_prefix_stays_empty() {
        let selector = ColorSelector::default();
        assert_eq!(selector.prefix_with_color("key", "").to_string(), "");
    }
}
