pub mod finnhub;
pub mod oanda_provider;
pub mod tiingo;

pub use finnhub::FinnhubProvider;
pub use oanda_provider::OandaProvider;
pub use tiingo::TiingoProvider;
