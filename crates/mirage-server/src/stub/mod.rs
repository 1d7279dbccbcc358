//! Stub model: operators, matching engine, responses and selection.

pub mod json_path;
pub mod matching;
pub mod operator;
pub mod regex_cache;
pub mod response;
pub mod selector;
pub mod template;
pub mod types;

pub use matching::{match_operator, MatchError};
pub use operator::{BodyOperator, FieldOperator, Operator, OperatorName};
pub use selector::select_stub;
