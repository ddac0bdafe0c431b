//! Domain XML parsing.
//!
//! Pulls the device information the service cares about (disks, interfaces,
//! graphics) out of a libvirt domain definition. Only attributes are read;
//! unknown elements are skipped.

use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};

use super::{
    DiskInfo, DriverError, GraphicsEndpoint, GraphicsKind, HardwareInfo, InterfaceInfo,
};

#[derive(Debug, Default)]
pub struct DomainDevices {
    pub disks: Vec<DiskInfo>,
    pub interfaces: Vec<InterfaceInfo>,
    pub graphics: Vec<GraphicsEndpoint>,
}

impl DomainDevices {
    pub fn into_hardware(self) -> HardwareInfo {
        HardwareInfo {
            disks: self.disks,
            interfaces: self.interfaces,
        }
    }
}

/// Parses the `<devices>` section of a domain definition.
pub fn parse_devices(xml: &str) -> Result<DomainDevices, DriverError> {
    let mut reader = Reader::from_str(xml);
    let mut devices = DomainDevices::default();

    let mut in_devices = false;
    let mut disk: Option<DiskInfo> = None;
    let mut interface: Option<InterfaceInfo> = None;

    loop {
        let event = reader
            .read_event()
            .map_err(|e| DriverError::Rpc(format!("failed to parse domain XML: {e}")))?;

        let is_start = matches!(event, Event::Start(_));
        match event {
            Event::Start(ref element) | Event::Empty(ref element) => {
                let name = element.local_name();
                match name.as_ref() {
                    b"devices" => in_devices = true,

                    // Self-closing disk/interface elements carry no target
                    // and are skipped.
                    b"disk" if in_devices && is_start => {
                        disk = Some(DiskInfo {
                            device: String::new(),
                            bus: String::new(),
                            format: String::new(),
                            path: String::new(),
                        });
                    }

                    b"interface" if in_devices && is_start => {
                        interface = Some(InterfaceInfo {
                            mac: String::new(),
                            bridge: String::new(),
                            model: String::new(),
                            device: String::new(),
                        });
                    }

                    b"graphics" if in_devices => {
                        devices.graphics.push(GraphicsEndpoint {
                            kind: match attr(element, b"type").as_deref() {
                                Some("vnc") => GraphicsKind::Vnc,
                                Some("spice") => GraphicsKind::Spice,
                                _ => {
                                    // Desktop-style protocols (sdl, egl-headless)
                                    // have no network endpoint to relay.
                                    continue;
                                }
                            },
                            port: bound_port(attr(element, b"port")),
                            tls_port: bound_port(attr(element, b"tlsPort")),
                            listen: attr(element, b"listen"),
                        });
                    }

                    b"driver" => {
                        if let Some(disk) = disk.as_mut()
                            && let Some(format) = attr(element, b"type")
                        {
                            disk.format = format;
                        }
                    }

                    b"source" => {
                        if let Some(disk) = disk.as_mut() {
                            // File- and block-backed disks carry their path in
                            // different attributes; unify them.
                            if let Some(path) =
                                attr(element, b"file").or_else(|| attr(element, b"dev"))
                            {
                                disk.path = path;
                            }
                        }
                        if let Some(interface) = interface.as_mut()
                            && let Some(bridge) = attr(element, b"bridge")
                        {
                            interface.bridge = bridge;
                        }
                    }

                    b"target" => {
                        if let Some(disk) = disk.as_mut() {
                            if let Some(dev) = attr(element, b"dev") {
                                disk.device = dev;
                            }
                            if let Some(bus) = attr(element, b"bus") {
                                disk.bus = bus;
                            }
                        }
                        if let Some(interface) = interface.as_mut()
                            && let Some(dev) = attr(element, b"dev")
                        {
                            interface.device = dev;
                        }
                    }

                    b"mac" => {
                        if let Some(interface) = interface.as_mut()
                            && let Some(address) = attr(element, b"address")
                        {
                            interface.mac = address;
                        }
                    }

                    b"model" => {
                        if let Some(interface) = interface.as_mut()
                            && let Some(model) = attr(element, b"type")
                        {
                            interface.model = model;
                        }
                    }

                    _ => {}
                }
            }

            Event::End(ref element) => match element.local_name().as_ref() {
                b"devices" => in_devices = false,
                b"disk" => {
                    if let Some(disk) = disk.take() {
                        devices.disks.push(disk);
                    }
                }
                b"interface" => {
                    if let Some(interface) = interface.take() {
                        devices.interfaces.push(interface);
                    }
                }
                _ => {}
            },

            Event::Eof => break,
            _ => {}
        }
    }

    Ok(devices)
}

fn attr(element: &BytesStart<'_>, name: &[u8]) -> Option<String> {
    element.attributes().flatten().find_map(|attribute| {
        if attribute.key.as_ref() == name {
            attribute
                .unescape_value()
                .ok()
                .map(|value| value.into_owned())
        } else {
            None
        }
    })
}

fn bound_port(raw: Option<String>) -> Option<u16> {
    let value: i32 = raw?.parse().ok()?;
    u16::try_from(value).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOMAIN_XML: &str = r#"
<domain type='kvm'>
  <name>web01</name>
  <devices>
    <disk type='file' device='disk'>
      <driver name='qemu' type='qcow2'/>
      <source file='/var/lib/libvirt/images/web01.qcow2'/>
      <target dev='vda' bus='virtio'/>
    </disk>
    <disk type='block' device='disk'>
      <driver name='qemu' type='raw'/>
      <source dev='/dev/vg0/web01-data'/>
      <target dev='vdb' bus='virtio'/>
    </disk>
    <interface type='bridge'>
      <mac address='52:54:00:aa:bb:cc'/>
      <source bridge='br0'/>
      <model type='virtio'/>
      <target dev='vnet3'/>
    </interface>
    <graphics type='vnc' port='5901' listen='0.0.0.0'/>
    <graphics type='spice' port='-1' tlsPort='5902' listen='127.0.0.1'/>
  </devices>
</domain>
"#;

    #[test]
    fn disks_unify_file_and_block_sources() {
        let devices = parse_devices(DOMAIN_XML).unwrap();
        assert_eq!(devices.disks.len(), 2);

        assert_eq!(devices.disks[0].device, "vda");
        assert_eq!(devices.disks[0].bus, "virtio");
        assert_eq!(devices.disks[0].format, "qcow2");
        assert_eq!(devices.disks[0].path, "/var/lib/libvirt/images/web01.qcow2");

        assert_eq!(devices.disks[1].device, "vdb");
        assert_eq!(devices.disks[1].path, "/dev/vg0/web01-data");
    }

    #[test]
    fn interfaces_carry_mac_bridge_model_and_device() {
        let devices = parse_devices(DOMAIN_XML).unwrap();
        assert_eq!(devices.interfaces.len(), 1);

        let nic = &devices.interfaces[0];
        assert_eq!(nic.mac, "52:54:00:aa:bb:cc");
        assert_eq!(nic.bridge, "br0");
        assert_eq!(nic.model, "virtio");
        assert_eq!(nic.device, "vnet3");
    }

    #[test]
    fn graphics_ports_drop_autoport_values() {
        let devices = parse_devices(DOMAIN_XML).unwrap();
        assert_eq!(devices.graphics.len(), 2);

        let vnc = &devices.graphics[0];
        assert_eq!(vnc.kind, GraphicsKind::Vnc);
        assert_eq!(vnc.port, Some(5901));
        assert_eq!(vnc.listen.as_deref(), Some("0.0.0.0"));

        let spice = &devices.graphics[1];
        assert_eq!(spice.kind, GraphicsKind::Spice);
        assert_eq!(spice.port, None);
        assert_eq!(spice.tls_port, Some(5902));
    }

    #[test]
    fn empty_devices_section_parses_cleanly() {
        let devices = parse_devices("<domain><devices/></domain>").unwrap();
        assert!(devices.disks.is_empty());
        assert!(devices.interfaces.is_empty());
        assert!(devices.graphics.is_empty());
    }
}
