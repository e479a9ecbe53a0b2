mod mysql;
mod result_queue;
mod tokio_postgres;

pub use self::in_memory_test::{
    InMemoryNativeClient, InMemoryTestResponseBuilder, NativeCall, ScriptedBatch,
};
pub use self::mysql::MySqlNativeClient;
pub use self::result_queue::BatchResult;
pub use self::tokio_postgres::PostgresNativeClient;

pub(crate) use self::result_queue::ResultQueue;

/// Character set and encoding names are spliced into SQL, so only plain
/// identifiers are accepted.
pub(crate) fn is_plain_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Quote an identifier with `quote`, doubling any embedded quote characters.
pub(crate) fn quote_identifier(name: &str, quote: char) -> String {
    let mut quoted = String::with_capacity(name.len() + 2);
    quoted.push(quote);
    for c in name.chars() {
        if c == quote {
            quoted.push(quote);
        }
        quoted.push(c);
    }
    quoted.push(quote);
    quoted
}
