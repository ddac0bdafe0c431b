//! Hypervisor URI parsing.
//!
//! Supported schemes: `qemu` / `qemu+unix` (local UNIX socket), `qemu+tcp`
//! (plain TCP) and `qemu+ssh` (UNIX socket on the remote end of an SSH
//! tunnel). Defaults follow libvirt conventions.

use url::Url;

use super::DriverError;

pub const DEFAULT_SOCKET_PATH: &str = "/var/run/libvirt/libvirt-sock";
pub const DEFAULT_TCP_PORT: u16 = 16509;
pub const DEFAULT_SSH_PORT: u16 = 22;
pub const DEFAULT_SSH_USER: &str = "root";

/// Where a hypervisor connection should be dialed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Unix {
        socket: String,
    },
    Tcp {
        host: String,
        port: u16,
    },
    Ssh {
        user: String,
        host: String,
        port: u16,
        remote_socket: String,
    },
}

pub fn parse(uri: &str) -> Result<Endpoint, DriverError> {
    let parsed = Url::parse(uri).map_err(|e| DriverError::InvalidUri(e.to_string()))?;

    match parsed.scheme() {
        "qemu" | "qemu+unix" => Ok(Endpoint::Unix {
            socket: socket_param(&parsed).unwrap_or_else(|| DEFAULT_SOCKET_PATH.to_string()),
        }),

        "qemu+tcp" => {
            let host = parsed
                .host_str()
                .ok_or_else(|| DriverError::InvalidUri(format!("'{uri}' has no host")))?
                .to_string();
            Ok(Endpoint::Tcp {
                host,
                port: parsed.port().unwrap_or(DEFAULT_TCP_PORT),
            })
        }

        "qemu+ssh" => {
            let host = parsed
                .host_str()
                .ok_or_else(|| DriverError::InvalidUri(format!("'{uri}' has no host")))?
                .to_string();
            let user = match parsed.username() {
                "" => DEFAULT_SSH_USER.to_string(),
                user => user.to_string(),
            };
            Ok(Endpoint::Ssh {
                user,
                host,
                port: parsed.port().unwrap_or(DEFAULT_SSH_PORT),
                remote_socket: socket_param(&parsed)
                    .unwrap_or_else(|| DEFAULT_SOCKET_PATH.to_string()),
            })
        }

        other => Err(DriverError::UnsupportedScheme(other.to_string())),
    }
}

/// Hostname a browser-facing relay can reach the hypervisor at, extracted
/// from the stored URI. None for local socket URIs.
pub fn reachable_host(uri: &str) -> Option<String> {
    let parsed = Url::parse(uri).ok()?;
    parsed.host_str().map(str::to_string)
}

fn socket_param(url: &Url) -> Option<String> {
    url.query_pairs()
        .find(|(key, _)| key == "socket")
        .map(|(_, value)| value.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_uri_defaults_to_the_system_socket() {
        let endpoint = parse("qemu:///system").unwrap();
        assert_eq!(
            endpoint,
            Endpoint::Unix {
                socket: DEFAULT_SOCKET_PATH.to_string()
            }
        );
    }

    #[test]
    fn unix_uri_honors_the_socket_parameter() {
        let endpoint = parse("qemu+unix:///system?socket=/tmp/libvirt.sock").unwrap();
        assert_eq!(
            endpoint,
            Endpoint::Unix {
                socket: "/tmp/libvirt.sock".to_string()
            }
        );
    }

    #[test]
    fn tcp_uri_gets_the_libvirt_default_port() {
        let endpoint = parse("qemu+tcp://kvm1.example/system").unwrap();
        assert_eq!(
            endpoint,
            Endpoint::Tcp {
                host: "kvm1.example".to_string(),
                port: DEFAULT_TCP_PORT
            }
        );
    }

    #[test]
    fn ssh_uri_defaults_user_port_and_remote_socket() {
        let endpoint = parse("qemu+ssh://kvm1.example/system").unwrap();
        assert_eq!(
            endpoint,
            Endpoint::Ssh {
                user: "root".to_string(),
                host: "kvm1.example".to_string(),
                port: DEFAULT_SSH_PORT,
                remote_socket: DEFAULT_SOCKET_PATH.to_string(),
            }
        );
    }

    #[test]
    fn ssh_uri_keeps_explicit_user_and_port() {
        let endpoint = parse("qemu+ssh://admin@kvm1.example:2222/system").unwrap();
        assert_eq!(
            endpoint,
            Endpoint::Ssh {
                user: "admin".to_string(),
                host: "kvm1.example".to_string(),
                port: 2222,
                remote_socket: DEFAULT_SOCKET_PATH.to_string(),
            }
        );
    }

    #[test]
    fn unknown_scheme_is_rejected() {
        assert!(matches!(
            parse("xen://host/system"),
            Err(DriverError::UnsupportedScheme(_))
        ));
    }

    #[test]
    fn reachable_host_strips_user_and_port() {
        assert_eq!(
            reachable_host("qemu+ssh://root@kvm1.example:2222/system"),
            Some("kvm1.example".to_string())
        );
        assert_eq!(reachable_host("qemu:///system"), None);
    }
}
