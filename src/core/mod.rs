pub mod languages;
pub mod outcome;
pub mod validator;

pub use languages::{LanguageProfile, LanguageRegistry, LanguageSummary, SecurityTier};
pub use outcome::{ExecutionResult, FailureKind, OutputChunk, OutputStream};
pub use validator::StaticValidator;
