use std::{
    fmt::Display,
    sync::{LazyLock, PoisonError, RwLock},
};

use miette::miette;
use nu_ansi_term::Color;

pub static COLOR: LazyLock<RwLock<bool>> = LazyLock::new(|| RwLock::new(true));

pub fn set_color(enabled: bool) {
    *COLOR.write().unwrap_or_else(PoisonError::into_inner) = enabled;
}

pub struct Colored<T: Display>(pub Color, pub T);

impl<T: Display> Display for Colored<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let color = COLOR.read().unwrap_or_else(PoisonError::into_inner);
        if *color {
            write!(f, "{}", self.0.prefix())?;
            self.1.fmt(f)?;
            write!(f, "{}", self.0.suffix())
        } else {
            self.1.fmt(f)
        }
    }
}

/// Parses `START-END` or `START-` into an inclusive byte range.
pub fn parse_range(input: &str) -> miette::Result<(u64, Option<u64>)> {
    let invalid = || miette!("invalid range `{input}`, expected START-END or START-");

    let (start, end) = input.trim().split_once('-').ok_or_else(invalid)?;
    let start = start.trim().parse::<u64>().map_err(|_| invalid())?;
    let end = match end.trim() {
        "" => None,
        end => Some(end.parse::<u64>().map_err(|_| invalid())?),
    };

    if end.is_some_and(|end| end < start) {
        return Err(invalid());
    }
    Ok((start, end))
}
