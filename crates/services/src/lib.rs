pub mod services;
pub mod test_support;
