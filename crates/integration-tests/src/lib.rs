//! End-to-end tests for atomic-rs that need no container engine or root.
//!
//! Every test builds a [`fixture::TestHost`] (results, staging and ledger
//! paths under one temporary directory) and drives the library against an
//! in-memory [`FakeEngine`](atomic_rs::engine::fake::FakeEngine). Tests
//! declare themselves with [`integration_test!`] in the module for the area
//! they cover; the module name becomes the trial's kind, so
//! `cargo test -p integration-tests -- staging` runs one area.

#![allow(unsafe_code)] // Required for linkme

use std::error::Error;

use libtest_mimic::{Arguments, Failed, Trial};
use linkme::distributed_slice;

pub mod fixture;

/// Result returned by every test body.
pub type TestResult = Result<(), Box<dyn Error + Send + Sync>>;

/// Tests registered by [`integration_test!`].
#[distributed_slice]
pub static INTEGRATION_TESTS: [fn() -> Trial];

/// Run all registered tests, ordered by area and name.
pub fn run_tests() -> color_eyre::Result<()> {
    color_eyre::install()?;

    let args = Arguments::from_args();
    let mut tests: Vec<Trial> = INTEGRATION_TESTS.iter().map(|register| register()).collect();
    tests.sort_by(|a, b| (a.kind(), a.name()).cmp(&(b.kind(), b.name())));

    libtest_mimic::run(&args, tests).exit();
}

/// Area of a test, from the module path of its registration.
pub fn area_of(module_path: &str) -> &str {
    module_path.rsplit("::").next().unwrap_or(module_path)
}

/// Turn a failed body into a trial failure carrying the whole error chain.
pub fn failure(err: &(dyn Error + 'static)) -> Failed {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str("\n  caused by: ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    Failed::from(message)
}

/// Register a test.
///
/// ```ignore
/// use integration_tests::{integration_test, fixture::TestHost};
///
/// integration_test!(test_stage_everything, || {
///     let host = TestHost::new()?;
///     let engine = host.engine();
///     // ...
///     Ok(())
/// });
/// ```
#[macro_export]
macro_rules! integration_test {
    ($name:ident, $body:expr) => {
        $crate::paste::paste! {
            #[$crate::linkme::distributed_slice($crate::INTEGRATION_TESTS)]
            #[linkme(crate = $crate::linkme)]
            fn [<__register_ $name>]() -> $crate::libtest_mimic::Trial {
                $crate::libtest_mimic::Trial::test(stringify!($name), move || {
                    let result: $crate::TestResult = $body();
                    result.map_err(|e| $crate::failure(&*e))
                })
                .with_kind($crate::area_of(module_path!()))
            }
        }
    };
}

// Re-export for use in macro
pub use libtest_mimic;
pub use linkme;
pub use paste;
