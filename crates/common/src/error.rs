//! Context helpers shared by every crate's error type.

// ── Shared context trait ────────────────────────────────────────────────────

/// Trait for error types that can be constructed from a plain message string.
///
/// Implement this for your crate's error type, then invoke [`impl_context!`]
/// in your error module to get `.context()` and `.with_context()` on `Result`
/// and `Option`.
pub trait FromMessage: Sized {
    fn from_message(message: String) -> Self;
}

/// Generate a crate-local `Context` trait with `.context()` and `.with_context()`
/// methods on `Result` and `Option`.
///
/// Invoke inside the module that defines the error type and its
/// `type Result<T> = std::result::Result<T, TheError>` alias, passing the error
/// type name.
///
/// ```ignore
/// // in crates/store/src/error.rs
/// mcpdock_common::impl_context!(StoreError);
/// ```
#[macro_export]
macro_rules! impl_context {
    ($err:ident) => {
        pub trait Context<T> {
            fn context(self, context: impl Into<String>) -> Result<T>;
            fn with_context<C, F>(self, f: F) -> Result<T>
            where
                C: Into<String>,
                F: FnOnce() -> C;
        }

        impl<T, E: std::fmt::Display> Context<T> for std::result::Result<T, E> {
            fn context(self, context: impl Into<String>) -> Result<T> {
                let ctx = context.into();
                self.map_err(|source| {
                    <$err as $crate::FromMessage>::from_message(format!("{ctx}: {source}"))
                })
            }

            fn with_context<C, F>(self, f: F) -> Result<T>
            where
                C: Into<String>,
                F: FnOnce() -> C,
            {
                self.map_err(|source| {
                    let ctx = f().into();
                    <$err as $crate::FromMessage>::from_message(format!("{ctx}: {source}"))
                })
            }
        }

        impl<T> Context<T> for Option<T> {
            fn context(self, context: impl Into<String>) -> Result<T> {
                self.ok_or_else(|| <$err as $crate::FromMessage>::from_message(context.into()))
            }

            fn with_context<C, F>(self, f: F) -> Result<T>
            where
                C: Into<String>,
                F: FnOnce() -> C,
            {
                self.ok_or_else(|| <$err as $crate::FromMessage>::from_message(f().into()))
            }
        }
    };
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    enum Error {
        #[error("{0}")]
        Message(String),
    }

    impl FromMessage for Error {
        fn from_message(message: String) -> Self {
            Self::Message(message)
        }
    }

    type Result<T> = std::result::Result<T, Error>;

    crate::impl_context!(Error);

    #[test]
    fn test_context_prefixes_source_message() {
        let res: std::result::Result<(), std::io::Error> =
            Err(std::io::Error::other("disk on fire"));
        let err = res.context("writing document").unwrap_err();
        assert_eq!(err.to_string(), "writing document: disk on fire");
    }

    #[test]
    fn test_option_context_uses_message() {
        let none: Option<u8> = None;
        let err = none.with_context(|| "missing value").unwrap_err();
        assert!(matches!(err, Error::Message(ref m) if m == "missing value"));
    }
}
