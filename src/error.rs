use std::{error, fmt, result};

/// Short form to compose Error values.
///
/// Here are few possible ways:
///
/// ```ignore
/// use crate::Error;
/// err_at!(Fatal, msg: "tree has consecutive reds at {}", idx);
/// ```
///
/// ```ignore
/// use crate::Error;
/// err_at!(IPCFail, tx.send(msg));
/// ```
///
/// ```ignore
/// use crate::Error;
/// err_at!(IOError, fs::read(file_path), "reading {:?}", file_path);
/// ```
///
/// In all cases, the first argument names the [Error] variant, the
/// variant shall carry a `file:line` prefix followed by a message.
#[macro_export]
macro_rules! err_at {
    ($v:ident, msg: $($arg:expr),+) => {{
        let prefix = format!("{}:{}", file!(), line!());
        Err($crate::Error::$v(prefix, format!($($arg),+)))
    }};
    ($v:ident, $e:expr) => {{
        match $e {
            Ok(val) => Ok(val),
            Err(err) => {
                let prefix = format!("{}:{}", file!(), line!());
                Err($crate::Error::$v(prefix, format!("{}", err)))
            }
        }
    }};
    ($v:ident, $e:expr, $($arg:expr),+) => {{
        match $e {
            Ok(val) => Ok(val),
            Err(err) => {
                let prefix = format!("{}:{}", file!(), line!());
                let msg = format!($($arg),+);
                Err($crate::Error::$v(prefix, format!("{} {}", err, msg)))
            }
        }
    }};
}

/// Error variants that can be returned by this package's API.
///
/// Each variant carries a prefix, typically identifying the
/// error location, and a message.
#[derive(Clone, PartialEq)]
pub enum Error {
    /// Internal consistency check failed. The tree instance that returned
    /// this error is poisoned and shall keep returning Fatal.
    Fatal(String, String),
    /// Invalid configuration or argument.
    InvalidInput(String, String),
    FailConvert(String, String),
    IOError(String, String),
    InvalidFile(String, String),
    /// Channel to the balancer thread is closed.
    IPCFail(String, String),
    /// Balancer thread exited abnormally.
    ThreadFail(String, String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        use Error::*;

        match self {
            Fatal(p, msg) => write!(f, "{} Fatal: {}", p, msg),
            InvalidInput(p, msg) => write!(f, "{} InvalidInput: {}", p, msg),
            FailConvert(p, msg) => write!(f, "{} FailConvert: {}", p, msg),
            IOError(p, msg) => write!(f, "{} IOError: {}", p, msg),
            InvalidFile(p, msg) => write!(f, "{} InvalidFile: {}", p, msg),
            IPCFail(p, msg) => write!(f, "{} IPCFail: {}", p, msg),
            ThreadFail(p, msg) => write!(f, "{} ThreadFail: {}", p, msg),
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        write!(f, "{}", self)
    }
}

impl error::Error for Error {}

/// Type alias for Result return type, used by this package.
pub type Result<T> = result::Result<T, Error>;
