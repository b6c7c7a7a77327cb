// Transport module: BLE GATT link layer

pub mod ble;
