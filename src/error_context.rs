// Copyright 2020 Joyent, Inc.

use std::fmt;

use crate::error::Error;

/// The last error recorded against a connection handle or a connection pool.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ErrorContext {
    message: String,
    code: i32,
}

impl ErrorContext {
    pub fn new<S: Into<String>>(message: S, code: i32) -> Self {
        ErrorContext {
            message: message.into(),
            code,
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn code(&self) -> i32 {
        self.code
    }

    pub fn is_empty(&self) -> bool {
        self.message.is_empty() && self.code == 0
    }

    pub fn set<S: Into<String>>(&mut self, message: S, code: i32) {
        self.message = message.into();
        self.code = code;
    }

    pub fn reset(&mut self) {
        self.message.clear();
        self.code = 0;
    }
}

impl From<&Error> for ErrorContext {
    fn from(err: &Error) -> Self {
        ErrorContext::new(err.to_string(), err.code())
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        if self.is_empty() {
            return Ok(());
        }
        write!(fmt, "{} (code {})", self.message, self.code)
    }
}
