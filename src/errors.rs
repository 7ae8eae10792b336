//! Error plumbing for the wire codec.
//!
//! Wire-format failures travel as [`std::io::Error`]: parsing happens over
//! `Cursor`s whose reads already fail that way, and every such error is
//! ultimately answered with a FORMERR/SERVFAIL value rather than unwound.
//! Typed errors (`thiserror`) are reserved for the richer surfaces:
//! presentation parsing, the JSON codec and configuration loading.

/// Early-returns an [`std::io::Error`] of the given kind with a formatted
/// message, e.g. `bail!(InvalidData, "invalid Type({})", value)`.
#[macro_export]
macro_rules! bail {
    ($kind:ident, $($arg:tt)*) => {
        // Construct the I/O error.
        return Err(
            ::std::io::Error::new(::std::io::ErrorKind::$kind, format!($($arg)*))
        )
    };
}

#[cfg(test)]
mod tests {
    use std::io;

    fn fails(flag: bool) -> io::Result<u32> {
        if flag {
            bail!(InvalidData, "flag was {}", flag);
        }
        Ok(7)
    }

    #[test]
    fn test_bail_short_circuits() {
        assert_eq!(fails(false).unwrap(), 7);

        let err = fails(true).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert_eq!(err.to_string(), "flag was true");
    }
}
