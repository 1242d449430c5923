//! Common test utilities

use cie_apdu_transport_pcsc::{PcscConfig, PcscDeviceManager, PcscTransport};

/// Try to get a PC/SC manager, `None` when no PC/SC service is running
pub fn get_manager() -> Option<PcscDeviceManager> {
    PcscDeviceManager::new().ok()
}

/// Try to get the name of a reader with a card inserted
pub fn get_reader_with_card(manager: &PcscDeviceManager) -> Option<String> {
    manager
        .list_readers()
        .ok()?
        .into_iter()
        .find(|r| r.has_card())
        .map(|r| r.name().to_string())
}

/// Try to get the name of a reader without a card
pub fn get_empty_reader(manager: &PcscDeviceManager) -> Option<String> {
    manager
        .list_readers()
        .ok()?
        .into_iter()
        .find(|r| !r.has_card())
        .map(|r| r.name().to_string())
}

/// Try to get a real transport for tests
pub fn get_test_transport() -> Option<PcscTransport> {
    let manager = get_manager()?;
    let reader_name = get_reader_with_card(&manager)?;
    manager
        .open_reader_with_config(&reader_name, PcscConfig::default())
        .ok()
}
