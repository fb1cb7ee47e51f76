//! Rule-chain classifier and the diagnostics engine binding it to the
//! knowledge store.

mod classifier;
mod engine;

pub use classifier::{Classifier, FailureInput};
pub use engine::{DiagnosisResult, DiagnosticsEngine};
