mod support;

mod registry_test;
mod traits_test;
mod ble_test;
mod usb_test;
mod router_test;
