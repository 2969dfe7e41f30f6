#![no_main]
use libfuzzer_sys::fuzz_target;
use sqlite_interop::{ConfigSource, FileConfig, Setting};

// Arbitrary TOML must either parse or error, never panic
fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    if let Ok(config) = FileConfig::parse(text) {
        for setting in Setting::ALL {
            let _ = config.get(setting);
        }
    }
});
