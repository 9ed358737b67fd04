mod access_policy;
mod attribute;

#[cfg(any(test, feature = "test_utils"))]
mod tests;

pub use access_policy::{AccessPolicy, PolicyDocument};
pub use attribute::{AttributeSet, AttributeToken, ATTRIBUTE_TOKEN_LENGTH};

#[cfg(any(test, feature = "test_utils"))]
pub use tests::{gen_policy, premium_driver, standard_driver};
