//! Error classification shared by every fallible operation.
//!
//! Each error enum maps to a stable machine code and a user-facing message.
//! Pages (and the CLI) show `user_message()` as a blocking notification that
//! names the failure category; there is no structured error UI.

pub trait ErrorCode: std::fmt::Display {
    fn error_code(&self) -> &'static str;

    /// Short message suitable for an alert box.
    fn user_message(&self) -> String {
        GENERIC_FAILURE_MESSAGE.to_owned()
    }

    fn retryable(&self) -> bool {
        false
    }
}

pub const GENERIC_FAILURE_MESSAGE: &str = "Something went wrong. Please try again.";
