pub mod config;
pub mod connection;
pub mod context;
pub mod delivery;
pub mod dispatch;
pub mod error;
pub mod ordering;
pub mod transaction;
pub mod wire;
pub mod test_util;


#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
