//! Test registration shared by the fusion-executor integration tests
//!
//! Tests register themselves with [`integration_test!`] and are collected
//! from the [`INTEGRATION_TESTS`] distributed slice at startup.

use linkme::distributed_slice;

/// Signature of a registered test.
pub type TestFn = fn() -> color_eyre::Result<()>;

/// A single registered test.
#[derive(Debug)]
pub struct IntegrationTest {
    pub name: &'static str,
    pub f: TestFn,
}

impl IntegrationTest {
    pub const fn new(name: &'static str, f: TestFn) -> Self {
        Self { name, f }
    }
}

/// All tests registered through [`integration_test!`].
#[distributed_slice]
pub static INTEGRATION_TESTS: [IntegrationTest];

/// Register a test function.
///
/// ```ignore
/// fn test_config_prints_json() -> Result<()> { Ok(()) }
/// integration_test!(test_config_prints_json);
/// ```
#[macro_export]
macro_rules! integration_test {
    ($fn_name:ident) => {
        const _: () = {
            #[::linkme::distributed_slice($crate::INTEGRATION_TESTS)]
            static TEST: $crate::IntegrationTest =
                $crate::IntegrationTest::new(stringify!($fn_name), $fn_name);
        };
    };
}
