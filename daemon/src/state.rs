use kronk_core::Config;
use kronk_engine::Dispatcher;

pub struct AppState {
    pub dispatcher: Dispatcher,
}

impl AppState {
    pub fn new(config: Config) -> anyhow::Result<Self> {
        Ok(Self {
            dispatcher: Dispatcher::new(config)?,
        })
    }
}
