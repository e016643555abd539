// geomesh - Offline-first multi-transport messaging core
//
// One canonical message model carried over whichever medium currently
// connects two devices: local Wi-Fi, an internet relay, BLE, Bluetooth
// Classic, a USB accessory link, or a WebRTC data channel. Callers send
// through a priority router and consume one inbound stream regardless of
// which medium delivered.

pub mod message;
pub mod transport;
