/// Console and rotated-file logging backend for the `log` facade.
pub mod loggerlocal;

pub use loggerlocal::{parse_level, rotate_logs, setup_logging, LoggerError};
