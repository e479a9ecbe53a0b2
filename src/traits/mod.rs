mod native;

pub use native::{
    ConnectParams, NativeClient, NativeHandle, NativeResult, PreparedOutcome, StoredResult,
};
