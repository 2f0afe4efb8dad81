//! Access capabilities
//!
//! Each enabled access method contributes one container port, one Service
//! port and, for HTTP methods, one ingress route.

use crds::DevelopmentEnvironmentSpec;
use k8s_openapi::api::core::v1::{ContainerPort, ServicePort};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Capability {
    Ssh,
    Jupyter,
    VsCode,
}

/// HTTP route exposed through the environment's Ingress
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngressRoute {
    pub path: &'static str,
    pub port_name: &'static str,
    pub port: i32,
}

/// Ports and routes collected from the enabled capabilities
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AccessSlice {
    pub container_ports: Vec<ContainerPort>,
    pub service_ports: Vec<ServicePort>,
    pub routes: Vec<IngressRoute>,
}

impl AccessSlice {
    /// Whether an Ingress is needed
    pub fn has_web(&self) -> bool {
        !self.routes.is_empty()
    }
}

impl Capability {
    /// Capabilities enabled by the spec, in a fixed order
    pub fn enabled(spec: &DevelopmentEnvironmentSpec) -> Vec<Capability> {
        [
            (spec.enable_ssh, Capability::Ssh),
            (spec.enable_jupyter, Capability::Jupyter),
            (spec.enable_vscode, Capability::VsCode),
        ]
        .into_iter()
        .filter_map(|(on, capability)| on.then_some(capability))
        .collect()
    }

    pub fn port_name(self) -> &'static str {
        match self {
            Capability::Ssh => "ssh",
            Capability::Jupyter => "jupyter",
            Capability::VsCode => "vscode",
        }
    }

    pub fn port(self) -> i32 {
        match self {
            Capability::Ssh => 22,
            Capability::Jupyter => 8888,
            Capability::VsCode => 8080,
        }
    }

    /// Ingress path for HTTP capabilities
    pub fn ingress_path(self) -> Option<&'static str> {
        match self {
            Capability::Ssh => None,
            Capability::Jupyter => Some("/jupyter"),
            Capability::VsCode => Some("/"),
        }
    }

    pub fn contribute(self, slice: &mut AccessSlice) {
        slice.container_ports.push(ContainerPort {
            name: Some(self.port_name().to_string()),
            container_port: self.port(),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        });
        slice.service_ports.push(ServicePort {
            name: Some(self.port_name().to_string()),
            port: self.port(),
            target_port: Some(IntOrString::Int(self.port())),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        });
        if let Some(path) = self.ingress_path() {
            slice.routes.push(IngressRoute {
                path,
                port_name: self.port_name(),
                port: self.port(),
            });
        }
    }
}

/// Fold every capability's contribution into one slice
pub fn access_slice(capabilities: &[Capability]) -> AccessSlice {
    let mut slice = AccessSlice::default();
    for capability in capabilities {
        capability.contribute(&mut slice);
    }
    slice
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ssh_only_has_no_routes() {
        let slice = access_slice(&[Capability::Ssh]);
        assert_eq!(slice.container_ports.len(), 1);
        assert_eq!(slice.service_ports[0].port, 22);
        assert_eq!(slice.service_ports[0].name.as_deref(), Some("ssh"));
        assert!(!slice.has_web());
    }

    #[test]
    fn test_each_capability_contributes_one_port() {
        let slice = access_slice(&[Capability::Ssh, Capability::Jupyter, Capability::VsCode]);
        let ports: Vec<i32> = slice.service_ports.iter().map(|p| p.port).collect();
        assert_eq!(ports, vec![22, 8888, 8080]);
        assert_eq!(slice.container_ports.len(), 3);

        let paths: Vec<&str> = slice.routes.iter().map(|r| r.path).collect();
        assert_eq!(paths, vec!["/jupyter", "/"]);
    }
}
