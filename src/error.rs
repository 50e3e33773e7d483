// Copyright 2025 Cloudflare, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The error type shared across the caching layer.

pub use std::error::Error as ErrorTrait;
use std::borrow::Cow;
use std::fmt;

/// The boxed [Error], the desired way to pass [Error]
pub type BError = Box<Error>;
/// Syntax sugar for `std::Result<T, BError>`
pub type Result<T, E = BError> = std::result::Result<T, E>;

/// The struct that represents an error
#[derive(Debug)]
pub struct Error {
    /// the type of error
    pub etype: ErrorType,
    /// an arbitrary string that explains the context when the error happens
    pub context: Option<Cow<'static, str>>,
    /// chain to the cause of this error
    pub cause: Option<Box<dyn ErrorTrait + Send + Sync>>,
}

/// Predefined type of errors
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum ErrorType {
    /// The downstream request cannot be keyed or classified
    MalformedRequest,
    /// A header exists but cannot be interpreted (bad date, bad integer)
    InvalidHTTPHeader,
    /// The storage backend failed during a read
    LookupError,
    /// The storage backend failed during a write
    StorageError,
    /// Failure reading an external file, e.g. a configuration file
    FileReadError,
    /// Catch all for failures inside the engine itself
    InternalError,
    /// Error to return the given status code to the client
    HTTPStatus(u16),
    /// Custom error with static string
    Custom(&'static str),
}

impl ErrorType {
    /// create a new type of error. Users should try to make `name` unique.
    pub const fn new(name: &'static str) -> Self {
        ErrorType::Custom(name)
    }

    /// for displaying the error type
    pub fn as_str(&self) -> &str {
        match self {
            ErrorType::MalformedRequest => "MalformedRequest",
            ErrorType::InvalidHTTPHeader => "InvalidHTTPHeader",
            ErrorType::LookupError => "LookupError",
            ErrorType::StorageError => "StorageError",
            ErrorType::FileReadError => "FileReadError",
            ErrorType::InternalError => "InternalError",
            ErrorType::HTTPStatus(_) => "HTTPStatus",
            ErrorType::Custom(s) => s,
        }
    }
}

impl Error {
    /// Simply create the error. See other functions that provide less verbose interfaces.
    #[inline]
    pub fn create(
        etype: ErrorType,
        context: Option<Cow<'static, str>>,
        cause: Option<Box<dyn ErrorTrait + Send + Sync>>,
    ) -> BError {
        Box::new(Error {
            etype,
            context,
            cause,
        })
    }

    /// Create an error with the given type
    #[inline]
    pub fn new(e: ErrorType) -> BError {
        Self::create(e, None, None)
    }

    /// Create an error with the given type, a context string and the causing error.
    /// This method is usually used when the error is caused by another error.
    #[inline]
    pub fn because<S: Into<Cow<'static, str>>, E: Into<Box<dyn ErrorTrait + Send + Sync>>>(
        e: ErrorType,
        context: S,
        cause: E,
    ) -> BError {
        Self::create(e, Some(context.into()), Some(cause.into()))
    }

    /// Short for `Err(Self::because(...))`
    #[inline]
    pub fn e_because<T, S: Into<Cow<'static, str>>, E: Into<Box<dyn ErrorTrait + Send + Sync>>>(
        e: ErrorType,
        context: S,
        cause: E,
    ) -> Result<T> {
        Err(Self::because(e, context, cause))
    }

    /// Create an error with context but no direct causing error
    #[inline]
    pub fn explain<S: Into<Cow<'static, str>>>(e: ErrorType, context: S) -> BError {
        Self::create(e, Some(context.into()), None)
    }

    /// Short for `Err(Self::explain(...))`
    #[inline]
    pub fn e_explain<T, S: Into<Cow<'static, str>>>(e: ErrorType, context: S) -> Result<T> {
        Err(Self::explain(e, context))
    }

    /// The type of this error
    pub fn etype(&self) -> &ErrorType {
        &self.etype
    }

    /// Chain the error with the given cause
    pub fn more_context<S: Into<Cow<'static, str>>>(self: BError, context: S) -> BError {
        let etype = self.etype.clone();
        Self::create(etype, Some(context.into()), Some(self))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.etype.as_str())?;
        if let Some(c) = self.context.as_ref() {
            write!(f, " context: {}", c)?;
        }
        if let Some(c) = self.cause.as_ref() {
            write!(f, " cause: {}", c)?;
        }
        Ok(())
    }
}

impl ErrorTrait for Error {}

/// Helper trait to add more context to a given error
pub trait OrErr<T, E> {
    /// Wrap the `Err(E)` in [Result] with the [ErrorType] and context, the existing
    /// `E` will be the cause.
    fn or_err(self, et: ErrorType, context: &'static str) -> Result<T, BError>
    where
        E: Into<Box<dyn ErrorTrait + Send + Sync>>;

    /// Similar to [OrErr::or_err], the closure is called to build the context string
    /// only when the error occurs.
    fn or_err_with<C: Into<Cow<'static, str>>, F: FnOnce() -> C>(
        self,
        et: ErrorType,
        context: F,
    ) -> Result<T, BError>
    where
        E: Into<Box<dyn ErrorTrait + Send + Sync>>;

    /// Replace the `Err(E)` with a new error, the existing `E` is discarded after
    /// the context closure reads it.
    fn explain_err<C: Into<Cow<'static, str>>, F: FnOnce(E) -> C>(
        self,
        et: ErrorType,
        context: F,
    ) -> Result<T, BError>;
}

impl<T, E> OrErr<T, E> for std::result::Result<T, E> {
    fn or_err(self, et: ErrorType, context: &'static str) -> Result<T, BError>
    where
        E: Into<Box<dyn ErrorTrait + Send + Sync>>,
    {
        self.map_err(|e| Error::because(et, context, e))
    }

    fn or_err_with<C: Into<Cow<'static, str>>, F: FnOnce() -> C>(
        self,
        et: ErrorType,
        context: F,
    ) -> Result<T, BError>
    where
        E: Into<Box<dyn ErrorTrait + Send + Sync>>,
    {
        self.map_err(|e| Error::because(et, context(), e))
    }

    fn explain_err<C: Into<Cow<'static, str>>, F: FnOnce(E) -> C>(
        self,
        et: ErrorType,
        context: F,
    ) -> Result<T, BError> {
        self.map_err(|e| Error::explain(et, context(e)))
    }
}
