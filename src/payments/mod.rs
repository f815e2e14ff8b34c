pub mod credentials;
pub mod error;
pub mod provider;
pub mod providers;
pub mod registry;
pub mod retry;
pub mod types;
pub mod utils;

pub use error::{PaymentError, PaymentResult, ProviderErrorCode};
pub use provider::{PaymentProvider, Provider};
pub use registry::{ProviderHealth, ProviderRegistry};
pub use retry::RetryPolicy;
pub use types::ProviderName;
