//! Results of best-effort operations.

/// Value produced by an operation that can fall back instead of failing.
///
/// `Degraded` carries the fallback value together with the reason the clean
/// path was not taken, so callers can tell the two apart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
    Ok(T),
    Degraded { value: T, warning: String },
}

impl<T> Outcome<T> {
    pub fn degraded(value: T, warning: impl Into<String>) -> Self {
        Outcome::Degraded {
            value,
            warning: warning.into(),
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, Outcome::Degraded { .. })
    }

    pub fn value(&self) -> &T {
        match self {
            Outcome::Ok(value) | Outcome::Degraded { value, .. } => value,
        }
    }

    pub fn into_value(self) -> T {
        match self {
            Outcome::Ok(value) | Outcome::Degraded { value, .. } => value,
        }
    }

    pub fn warning(&self) -> Option<&str> {
        match self {
            Outcome::Ok(_) => None,
            Outcome::Degraded { warning, .. } => Some(warning),
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Outcome::Ok(value) => Outcome::Ok(f(value)),
            Outcome::Degraded { value, warning } => Outcome::Degraded {
                value: f(value),
                warning,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ok_has_no_warning() {
        let outcome = Outcome::Ok(3);
        assert!(!outcome.is_degraded());
        assert_eq!(outcome.warning(), None);
        assert_eq!(outcome.into_value(), 3);
    }

    #[test]
    fn test_map_keeps_warning() {
        let outcome = Outcome::degraded(vec!["main"], "fetch failed").map(|v| v.len());
        assert_eq!(outcome.warning(), Some("fetch failed"));
        assert_eq!(*outcome.value(), 1);
    }
}
