pub mod loader;
pub mod types;

pub use loader::{load_device_configs, parse_device_configs};
pub use types::{
    AddressError, Credentials, DeviceAddress, DeviceConfig, DeviceConfigError,
    DeviceConfigResult, KEY_ADDRESS, KEY_LOGIN, KEY_PASSWORD, PARAM_DEFAULTS,
};
