pub mod env;
pub mod logger;
pub mod readable_size;
