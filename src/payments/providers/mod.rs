pub mod ayapay;
pub mod kbzpay;
pub mod wavepay;

pub use ayapay::AyaPayProvider;
pub use kbzpay::KbzPayProvider;
pub use wavepay::WavePayProvider;
