pub mod graphics;
pub mod hosts;
pub mod networks;
pub mod vms;
pub mod volumes;
