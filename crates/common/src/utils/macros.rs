//! Macros for reducing boilerplate code

/// Implements Display and FromStr traits for status enums
///
/// This macro generates:
/// - Display trait: converts enum variants to their lowercase names
/// - FromStr trait: parses case-insensitive strings to enum variants
///
/// The string mapping must be written in lowercase.
///
/// ```rust
/// use taskgate_common::impl_status_conversions;
///
/// #[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// pub enum Lane {
///     Fast,
///     Slow,
/// }
///
/// impl_status_conversions!(Lane {
///     Fast => "fast",
///     Slow => "slow",
/// });
///
/// assert_eq!(Lane::Fast.to_string(), "fast");
/// assert_eq!("SLOW".parse::<Lane>(), Ok(Lane::Slow));
/// ```
#[macro_export]
macro_rules! impl_status_conversions {
    ($enum_name:ident { $($variant:ident => $str:expr),+ $(,)? }) => {
        impl std::fmt::Display for $enum_name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                match self {
                    $(Self::$variant => write!(f, $str),)+
                }
            }
        }

        impl std::str::FromStr for $enum_name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.to_lowercase().as_str() {
                    $($str => Ok(Self::$variant),)+
                    _ => Err(format!("Invalid {}: {}", stringify!($enum_name), s)),
                }
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Phase {
        Queued,
        Running,
        Settled,
    }

    impl_status_conversions!(Phase {
        Queued => "queued",
        Running => "running",
        Settled => "settled",
    });

    #[test]
    fn test_display_conversion() {
        assert_eq!(Phase::Queued.to_string(), "queued");
        assert_eq!(Phase::Running.to_string(), "running");
        assert_eq!(Phase::Settled.to_string(), "settled");
    }

    #[test]
    fn test_fromstr_case_insensitive() {
        assert_eq!(Phase::from_str("queued").unwrap(), Phase::Queued);
        assert_eq!(Phase::from_str("RUNNING").unwrap(), Phase::Running);
        assert_eq!(Phase::from_str("Settled").unwrap(), Phase::Settled);
    }

    #[test]
    fn test_fromstr_invalid() {
        let err = Phase::from_str("paused").unwrap_err();
        assert!(err.contains("Invalid Phase"));
        assert!(err.contains("paused"));
    }
}
