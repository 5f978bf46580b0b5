pub mod provider;
pub mod trunk;
