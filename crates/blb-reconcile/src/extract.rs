//! Desired state extraction.
//!
//! [`extract`] turns a Service object into the normalized configuration of
//! its load balancer and elastic IP. It is a pure function: nothing is
//! mutated and no remote call is made.

use std::collections::BTreeMap;
use std::net::IpAddr;

use blb_cloud::{BillingMethod, PaymentTiming, Protocol};
use blb_core::{ClusterId, LoadBalancerId, SubnetId};
use k8s_openapi::api::core::v1::Service;

use crate::annotations::{self, service_annotation, ServiceKey};
use crate::error::{ReconcileError, Result};

/// Maximum load balancer name length accepted by the vendor.
pub const MAX_LOAD_BALANCER_NAME_LEN: usize = 65;

/// Default elastic IP bandwidth.
pub const DEFAULT_BANDWIDTH_MBPS: u32 = 1000;

/// Reservation lengths a prepaid address can be bought for.
pub const RESERVATION_MONTHS: [u32; 12] = [1, 2, 3, 4, 5, 6, 7, 8, 9, 12, 24, 36];

/// One declared Service port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortSpec {
    /// Front-end port.
    pub port: u16,
    /// Protocol.
    pub protocol: Protocol,
    /// Node port the traffic is forwarded to.
    pub node_port: u16,
}

/// The normalized load balancer configuration of a Service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredLoadBalancerConfig {
    /// Name of the load balancer (`{cluster}/{namespace}/{name}`, shortened).
    pub name: String,
    /// Serve the internal address instead of binding an elastic IP.
    pub use_internal_address: bool,
    /// User-supplied load balancer that must never be deleted.
    pub existing_load_balancer_id: Option<LoadBalancerId>,
    /// Cached id of a load balancer created earlier.
    pub cached_load_balancer_id: Option<LoadBalancerId>,
    /// Subnet to create the load balancer in.
    pub subnet_id: Option<SubnetId>,
    /// Node labels a backend must carry.
    pub backend_selector: BTreeMap<String, String>,
    /// Target number of backends; `None` registers every eligible node.
    pub max_backends: Option<usize>,
    /// Declared ports, one per front-end port.
    pub ports: Vec<PortSpec>,
}

/// The normalized elastic IP configuration of a Service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredEipConfig {
    /// Name of the address.
    pub name: String,
    /// When the address is paid for.
    pub payment_timing: PaymentTiming,
    /// Metering; `None` for prepaid addresses.
    pub billing_method: Option<BillingMethod>,
    /// Bandwidth in Mbps.
    pub bandwidth_mbps: u32,
    /// Reserved months; only for prepaid addresses.
    pub reservation_months: Option<u32>,
    /// Address requested through `spec.loadBalancerIP`.
    pub pinned_address: Option<IpAddr>,
}

/// The load balancer name for a Service.
#[must_use]
pub fn load_balancer_name(cluster: &ClusterId, key: &ServiceKey) -> String {
    let full = format!("{cluster}/{}/{}", key.namespace, key.name);
    match full.char_indices().nth(MAX_LOAD_BALANCER_NAME_LEN) {
        Some((cut, _)) => full[..cut].to_string(),
        None => full,
    }
}

/// Whether the Service asks for internal-address mode.
#[must_use]
pub fn wants_internal_address(service: &Service) -> bool {
    service_annotation(service, annotations::INTERNAL_VPC) == Some("true")
}

/// The user-pinned address from `spec.loadBalancerIP`, if any.
///
/// # Errors
///
/// Returns `ReconcileError::Validation` if the value is not an IP address.
pub fn pinned_address(service: &Service) -> Result<Option<IpAddr>> {
    match service
        .spec
        .as_ref()
        .and_then(|s| s.load_balancer_ip.as_deref())
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| ReconcileError::Validation(format!("loadBalancerIP {raw:?} is not an IP"))),
        None => Ok(None),
    }
}

/// An optional identifier annotation.
///
/// # Errors
///
/// Returns `ReconcileError::Validation` if the value is not a valid identifier.
pub fn id_annotation<T>(service: &Service, key: &str) -> Result<Option<T>>
where
    T: TryFrom<String, Error = blb_core::IdError>,
{
    match service_annotation(service, key).map(str::trim).filter(|s| !s.is_empty()) {
        Some(raw) => T::try_from(raw.to_string())
            .map(Some)
            .map_err(|e| ReconcileError::Validation(format!("annotation {key}: {e}"))),
        None => Ok(None),
    }
}

fn parsed<T: std::str::FromStr>(service: &Service, key: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match service_annotation(service, key).map(str::trim).filter(|s| !s.is_empty()) {
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|e| ReconcileError::Validation(format!("annotation {key}={raw:?}: {e}"))),
        None => Ok(None),
    }
}

/// Parse a `k=v,k2=v2` label selector.
///
/// # Errors
///
/// Returns `ReconcileError::Validation` for entries without `=` or with an empty key.
pub fn parse_selector(raw: &str) -> Result<BTreeMap<String, String>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) if !k.trim().is_empty() => {
                Ok((k.trim().to_string(), v.trim().to_string()))
            }
            _ => Err(ReconcileError::Validation(format!(
                "malformed backend label {pair:?}"
            ))),
        })
        .collect()
}

fn extract_ports(service: &Service) -> Result<Vec<PortSpec>> {
    let declared = service
        .spec
        .as_ref()
        .and_then(|s| s.ports.as_ref())
        .map(Vec::as_slice)
        .unwrap_or_default();
    if declared.is_empty() {
        return Err(ReconcileError::Validation(
            "service declares no ports".to_string(),
        ));
    }

    let mut ports = Vec::with_capacity(declared.len());
    for p in declared {
        let protocol: Protocol = p
            .protocol
            .as_deref()
            .unwrap_or("TCP")
            .parse()
            .map_err(ReconcileError::Validation)?;
        if !protocol.is_supported() {
            return Err(ReconcileError::Validation(format!(
                "port {}: {protocol} listeners are not supported",
                p.port
            )));
        }

        let port = u16::try_from(p.port)
            .map_err(|_| ReconcileError::Validation(format!("port {} out of range", p.port)))?;
        let node_port = p
            .node_port
            .ok_or_else(|| {
                ReconcileError::Validation(format!("port {port} has no node port allocated"))
            })
            .and_then(|np| {
                u16::try_from(np).map_err(|_| {
                    ReconcileError::Validation(format!("node port {np} out of range"))
                })
            })?;

        if ports.iter().any(|existing: &PortSpec| existing.port == port) {
            return Err(ReconcileError::Validation(format!(
                "port {port} declared more than once"
            )));
        }
        ports.push(PortSpec {
            port,
            protocol,
            node_port,
        });
    }

    Ok(ports)
}

fn extract_eip(service: &Service, default_name: &str) -> Result<DesiredEipConfig> {
    let payment_timing: PaymentTiming =
        parsed(service, annotations::EIP_PAYMENT_TIMING)?.unwrap_or_default();
    let billing_method: Option<BillingMethod> = parsed(service, annotations::EIP_BILLING_METHOD)?;
    let bandwidth: Option<u32> = parsed(service, annotations::EIP_BANDWIDTH)?;
    let reservation: Option<u32> = parsed(service, annotations::EIP_RESERVATION_LENGTH)?;

    let (billing_method, max_bandwidth, reservation_months) = match payment_timing {
        PaymentTiming::Prepaid => {
            if billing_method.is_some() {
                return Err(ReconcileError::Validation(
                    "billing method cannot be set for a prepaid address".to_string(),
                ));
            }
            let months = reservation.unwrap_or(1);
            if !RESERVATION_MONTHS.contains(&months) {
                return Err(ReconcileError::Validation(format!(
                    "reservation length {months} must be one of {RESERVATION_MONTHS:?}"
                )));
            }
            (None, 200, Some(months))
        }
        PaymentTiming::Postpaid => {
            let method = billing_method.unwrap_or_default();
            let max = match method {
                BillingMethod::ByTraffic => 1000,
                BillingMethod::ByBandwidth => 200,
            };
            (Some(method), max, None)
        }
    };

    let bandwidth_mbps = bandwidth.unwrap_or(DEFAULT_BANDWIDTH_MBPS.min(max_bandwidth));
    if !(1..=max_bandwidth).contains(&bandwidth_mbps) {
        return Err(ReconcileError::Validation(format!(
            "bandwidth {bandwidth_mbps} Mbps must be within 1..={max_bandwidth}"
        )));
    }

    let name = service_annotation(service, annotations::EIP_NAME)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(default_name)
        .to_string();

    Ok(DesiredEipConfig {
        name,
        payment_timing,
        billing_method,
        bandwidth_mbps,
        reservation_months,
        pinned_address: pinned_address(service)?,
    })
}

/// Derive the desired load balancer and elastic IP configuration of a Service.
///
/// Missing annotations fall back to `Postpaid`, `ByTraffic` and 1000 Mbps.
///
/// # Errors
///
/// Returns `ReconcileError::Validation` when the port list is empty, a port
/// uses an unsupported protocol, billing parameters are out of bounds, or
/// mutually exclusive settings are combined.
pub fn extract(
    service: &Service,
    cluster: &ClusterId,
) -> Result<(DesiredLoadBalancerConfig, DesiredEipConfig)> {
    let key = ServiceKey::of(service);
    if key.name.is_empty() {
        return Err(ReconcileError::Validation("service has no name".to_string()));
    }

    let service_type = service.spec.as_ref().and_then(|s| s.type_.as_deref());
    if service_type != Some("LoadBalancer") {
        return Err(ReconcileError::Validation(format!(
            "service type {service_type:?} is not LoadBalancer"
        )));
    }

    let name = load_balancer_name(cluster, &key);
    let ports = extract_ports(service)?;
    let eip = extract_eip(service, &name)?;
    let use_internal_address = wants_internal_address(service);
    if use_internal_address && eip.pinned_address.is_some() {
        return Err(ReconcileError::Validation(
            "loadBalancerIP cannot be combined with internal-address mode".to_string(),
        ));
    }

    let max_backends: Option<usize> = parsed(service, annotations::MAX_BACKENDS)?;
    if max_backends == Some(0) {
        return Err(ReconcileError::Validation(
            "backend count must be positive".to_string(),
        ));
    }

    let lb = DesiredLoadBalancerConfig {
        name,
        use_internal_address,
        existing_load_balancer_id: id_annotation(service, annotations::EXISTING_LOAD_BALANCER_ID)?,
        cached_load_balancer_id: id_annotation(service, annotations::LOAD_BALANCER_ID)?,
        subnet_id: id_annotation(service, annotations::SUBNET_ID)?,
        backend_selector: service_annotation(service, annotations::BACKEND_LABEL)
            .map(parse_selector)
            .transpose()?
            .unwrap_or_default(),
        max_backends,
        ports,
    };

    Ok((lb, eip))
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{ServicePort, ServiceSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn port(port: i32, protocol: &str, node_port: i32) -> ServicePort {
        ServicePort {
            port,
            protocol: Some(protocol.to_string()),
            node_port: Some(node_port),
            ..ServicePort::default()
        }
    }

    fn service(annotations: &[(&str, &str)], ports: Vec<ServicePort>) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some("web".into()),
                namespace: Some("default".into()),
                annotations: Some(
                    annotations
                        .iter()
                        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                        .collect(),
                ),
                ..ObjectMeta::default()
            },
            spec: Some(ServiceSpec {
                type_: Some("LoadBalancer".into()),
                ports: Some(ports),
                ..ServiceSpec::default()
            }),
            ..Service::default()
        }
    }

    fn cluster() -> ClusterId {
        ClusterId::new("c-1").unwrap()
    }

    fn validation_error(result: Result<(DesiredLoadBalancerConfig, DesiredEipConfig)>) -> String {
        match result {
            Err(ReconcileError::Validation(msg)) => msg,
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn defaults_apply_without_annotations() {
        let svc = service(&[], vec![port(80, "TCP", 30080)]);
        let (lb, eip) = extract(&svc, &cluster()).unwrap();

        assert_eq!(lb.name, "c-1/default/web");
        assert!(!lb.use_internal_address);
        assert_eq!(
            lb.ports,
            vec![PortSpec {
                port: 80,
                protocol: Protocol::Tcp,
                node_port: 30080
            }]
        );
        assert_eq!(eip.name, "c-1/default/web");
        assert_eq!(eip.payment_timing, PaymentTiming::Postpaid);
        assert_eq!(eip.billing_method, Some(BillingMethod::ByTraffic));
        assert_eq!(eip.bandwidth_mbps, 1000);
        assert_eq!(eip.reservation_months, None);
        assert_eq!(eip.pinned_address, None);
    }

    #[test]
    fn empty_ports_rejected() {
        let svc = service(&[], vec![]);
        assert!(validation_error(extract(&svc, &cluster())).contains("no ports"));
    }

    #[test]
    fn layer7_protocols_rejected() {
        let svc = service(&[], vec![port(80, "TCP", 30080), port(443, "HTTPS", 30443)]);
        assert!(validation_error(extract(&svc, &cluster())).contains("HTTPS"));
    }

    #[test]
    fn missing_node_port_rejected() {
        let mut p = port(80, "TCP", 30080);
        p.node_port = None;
        let svc = service(&[], vec![p]);
        assert!(validation_error(extract(&svc, &cluster())).contains("node port"));
    }

    #[test]
    fn prepaid_excludes_billing_method() {
        let svc = service(
            &[
                (annotations::EIP_PAYMENT_TIMING, "Prepaid"),
                (annotations::EIP_BILLING_METHOD, "ByTraffic"),
            ],
            vec![port(80, "TCP", 30080)],
        );
        assert!(validation_error(extract(&svc, &cluster())).contains("prepaid"));
    }

    #[test]
    fn prepaid_defaults_and_bounds() {
        let svc = service(
            &[(annotations::EIP_PAYMENT_TIMING, "Prepaid")],
            vec![port(80, "TCP", 30080)],
        );
        let (_, eip) = extract(&svc, &cluster()).unwrap();
        assert_eq!(eip.billing_method, None);
        assert_eq!(eip.bandwidth_mbps, 200);
        assert_eq!(eip.reservation_months, Some(1));

        let svc = service(
            &[
                (annotations::EIP_PAYMENT_TIMING, "Prepaid"),
                (annotations::EIP_BANDWIDTH, "201"),
            ],
            vec![port(80, "TCP", 30080)],
        );
        assert!(validation_error(extract(&svc, &cluster())).contains("1..=200"));
    }

    #[test]
    fn reservation_months_must_be_offered() {
        for (months, ok) in [("9", true), ("10", false), ("12", true), ("36", true), ("48", false)] {
            let svc = service(
                &[
                    (annotations::EIP_PAYMENT_TIMING, "Prepaid"),
                    (annotations::EIP_RESERVATION_LENGTH, months),
                ],
                vec![port(80, "TCP", 30080)],
            );
            assert_eq!(extract(&svc, &cluster()).is_ok(), ok, "months={months}");
        }
    }

    #[test]
    fn postpaid_bandwidth_bounds() {
        let cases = [
            ("ByTraffic", "1000", true),
            ("ByTraffic", "1001", false),
            ("ByBandwidth", "200", true),
            ("ByBandwidth", "201", false),
            ("ByTraffic", "0", false),
        ];
        for (method, bandwidth, ok) in cases {
            let svc = service(
                &[
                    (annotations::EIP_BILLING_METHOD, method),
                    (annotations::EIP_BANDWIDTH, bandwidth),
                ],
                vec![port(80, "TCP", 30080)],
            );
            assert_eq!(
                extract(&svc, &cluster()).is_ok(),
                ok,
                "{method} {bandwidth}"
            );
        }
    }

    #[test]
    fn by_bandwidth_default_is_capped() {
        let svc = service(
            &[(annotations::EIP_BILLING_METHOD, "ByBandwidth")],
            vec![port(80, "TCP", 30080)],
        );
        let (_, eip) = extract(&svc, &cluster()).unwrap();
        assert_eq!(eip.bandwidth_mbps, 200);
    }

    #[test]
    fn annotations_parsed() {
        let svc = service(
            &[
                (annotations::INTERNAL_VPC, "true"),
                (annotations::EXISTING_LOAD_BALANCER_ID, "lb-user"),
                (annotations::SUBNET_ID, "sbn-9"),
                (annotations::BACKEND_LABEL, "role=edge, zone=a"),
                (annotations::MAX_BACKENDS, "3"),
                (annotations::EIP_NAME, "my-eip"),
            ],
            vec![port(53, "UDP", 30053)],
        );
        let (lb, eip) = extract(&svc, &cluster()).unwrap();

        assert!(lb.use_internal_address);
        assert_eq!(lb.existing_load_balancer_id.unwrap().as_str(), "lb-user");
        assert_eq!(lb.subnet_id.unwrap().as_str(), "sbn-9");
        assert_eq!(lb.backend_selector.get("role").map(String::as_str), Some("edge"));
        assert_eq!(lb.backend_selector.get("zone").map(String::as_str), Some("a"));
        assert_eq!(lb.max_backends, Some(3));
        assert_eq!(lb.ports[0].protocol, Protocol::Udp);
        assert_eq!(eip.name, "my-eip");
    }

    #[test]
    fn pinned_address_from_spec() {
        let mut svc = service(&[], vec![port(80, "TCP", 30080)]);
        svc.spec.as_mut().unwrap().load_balancer_ip = Some("180.76.3.3".into());
        let (_, eip) = extract(&svc, &cluster()).unwrap();
        assert_eq!(eip.pinned_address, Some("180.76.3.3".parse().unwrap()));

        svc.spec.as_mut().unwrap().load_balancer_ip = Some("not-an-ip".into());
        assert!(validation_error(extract(&svc, &cluster())).contains("not-an-ip"));
    }

    #[test]
    fn long_names_shortened() {
        let key = ServiceKey::new("a-very-long-namespace-name", "an-even-longer-service-name-here");
        let name = load_balancer_name(&ClusterId::new("cce-abcdefgh").unwrap(), &key);
        assert_eq!(name.chars().count(), MAX_LOAD_BALANCER_NAME_LEN);
        assert!(name.starts_with("cce-abcdefgh/a-very-long-namespace-name/"));
    }

    #[test]
    fn malformed_selector() {
        assert!(parse_selector("role").is_err());
        assert!(parse_selector("=x").is_err());
        assert!(parse_selector("").unwrap().is_empty());
    }

    #[test]
    fn non_load_balancer_type_rejected() {
        let mut svc = service(&[], vec![port(80, "TCP", 30080)]);
        svc.spec.as_mut().unwrap().type_ = Some("ClusterIP".into());
        assert!(validation_error(extract(&svc, &cluster())).contains("ClusterIP"));
    }
}
