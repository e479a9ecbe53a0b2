mod raw_result;
mod sql_value;

pub use raw_result::RawQueryResult;
pub use sql_value::SqlValue;
