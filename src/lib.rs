/// model-fixtures library crate.
///
/// Builds reference model fixtures from tabular datasets: each fixture is a
/// trained model exported to `savedmodel/<Fixture>/` plus its predictions
/// over the training data in `csv/<Fixture>.csv`.
///
/// The binary entry point (src/main.rs) drives these same modules, and
/// integration tests in tests/ import them via `model_fixtures::`.
pub mod catalog;
pub mod config;
pub mod driver;
pub mod encoding;
pub mod errors;
pub mod estimator;
pub mod input_fn;
pub mod roles;
pub mod store;
pub mod table;
pub mod utils;
