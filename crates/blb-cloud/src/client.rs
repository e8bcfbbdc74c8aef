//! HTTP client for the vendor APIs.
//!
//! This module provides [`HttpCloudClient`], a reqwest implementation of
//! every collaborator trait. Request signing is delegated to the injected
//! [`CredentialProvider`]; this client only attaches the current token.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use blb_core::{ClusterId, InstanceId, LoadBalancerId, RouteRuleId, SubnetId, VpcId};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::api::{ClusterApi, EipApi, LoadBalancerApi, VpcApi};
use crate::credentials::CredentialProvider;
use crate::error::{CloudError, Result};
use crate::types::{
    Backend, ClusterNode, CreateEipArgs, CreateLoadBalancerArgs, CreateRouteRuleArgs,
    CreateSubnetArgs, Eip, Listener, LoadBalancer, LoadBalancerStatus, Protocol, RouteTable,
    Subnet, UpdateLoadBalancerArgs,
};
use crate::CloudConfig;

/// Scheduling algorithm requested for new listeners.
const LISTENER_SCHEDULER: &str = "RoundRobin";

/// Instance type the vendor expects when binding an address to a load balancer.
const BIND_INSTANCE_TYPE: &str = "BLB";

/// Error body returned by the vendor.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

/// HTTP client for the load balancer, EIP, VPC and cluster APIs.
#[derive(Clone)]
pub struct HttpCloudClient {
    client: reqwest::Client,
    config: CloudConfig,
    credentials: Arc<dyn CredentialProvider>,
}

impl std::fmt::Debug for HttpCloudClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpCloudClient")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl HttpCloudClient {
    /// Create a new client.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: CloudConfig, credentials: Arc<dyn CredentialProvider>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .connect_timeout(Duration::from_secs(5))
            .build()?;

        Ok(Self {
            client,
            config,
            credentials,
        })
    }

    /// Get a reference to the client config.
    #[must_use]
    pub fn config(&self) -> &CloudConfig {
        &self.config
    }

    fn request(&self, method: Method, url: &str) -> Result<reqwest::RequestBuilder> {
        let token = self.credentials.current_token()?;
        Ok(self.client.request(method, url).bearer_auth(token.token))
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.json::<ErrorBody>().await.unwrap_or(ErrorBody {
            code: String::new(),
            message: format!("vendor returned status {status}"),
        });
        Err(CloudError::from_status(status.as_u16(), body.code, body.message))
    }

    async fn send_json<T: DeserializeOwned>(&self, request: reqwest::RequestBuilder) -> Result<T> {
        let response = Self::check(request.send().await?).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| CloudError::Decode(e.to_string()))
    }

    async fn send_empty(&self, request: reqwest::RequestBuilder) -> Result<()> {
        Self::check(request.send().await?).await.map(|_| ())
    }

    fn listener_url(&self, id: &LoadBalancerId, protocol: Protocol) -> Result<String> {
        match protocol {
            Protocol::Tcp | Protocol::Udp => Ok(format!(
                "{}/v1/blb/{id}/{}listener",
                self.config.blb_endpoint,
                protocol.as_str()
            )),
            // TODO: layer-7 listeners need certificate and policy plumbing.
            Protocol::Http | Protocol::Https => Err(CloudError::Unsupported(format!(
                "{protocol} listeners"
            ))),
        }
    }
}

// ============================================================================
// Wire envelopes
// ============================================================================

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoadBalancerList {
    #[serde(default)]
    blb_list: Vec<LoadBalancer>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreatedLoadBalancer {
    blb_id: LoadBalancerId,
    name: String,
    #[serde(default)]
    address: Option<IpAddr>,
    #[serde(default)]
    desc: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawListener {
    listener_port: u16,
    backend_port: u16,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListenerList {
    #[serde(default)]
    listener_list: Vec<RawListener>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ListenerBody {
    #[serde(skip_serializing_if = "Option::is_none")]
    listener_port: Option<u16>,
    backend_port: u16,
    scheduler: &'static str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PortList<'a> {
    port_list: &'a [u16],
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BackendList<T> {
    #[serde(default = "Vec::new")]
    backend_server_list: Vec<T>,
}

#[derive(Deserialize)]
struct CreatedEip {
    eip: IpAddr,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EipList {
    #[serde(default)]
    eip_list: Vec<Eip>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BindBody<'a> {
    instance_type: &'static str,
    instance_id: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ResizeBody {
    new_bandwidth_in_mbps: u32,
}

#[derive(Deserialize)]
struct SubnetEnvelope {
    subnet: Subnet,
}

#[derive(Deserialize)]
struct SubnetList {
    #[serde(default)]
    subnets: Vec<Subnet>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreatedSubnet {
    subnet_id: SubnetId,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreatedRouteRule {
    route_rule_id: RouteRuleId,
}

#[derive(Deserialize)]
struct InstanceList {
    #[serde(default)]
    instances: Vec<ClusterNode>,
}

// ============================================================================
// Trait implementations
// ============================================================================

#[async_trait]
impl LoadBalancerApi for HttpCloudClient {
    async fn describe_load_balancer(&self, id: &LoadBalancerId) -> Result<LoadBalancer> {
        let url = format!("{}/v1/blb/{id}", self.config.blb_endpoint);
        self.send_json(self.request(Method::GET, &url)?).await
    }

    async fn describe_load_balancers_by_name(&self, name: &str) -> Result<Vec<LoadBalancer>> {
        let url = format!("{}/v1/blb", self.config.blb_endpoint);
        let request = self.request(Method::GET, &url)?.query(&[("name", name)]);
        let list: LoadBalancerList = self.send_json(request).await?;

        // The vendor filter is a prefix match
        Ok(list
            .blb_list
            .into_iter()
            .filter(|lb| lb.name == name)
            .collect())
    }

    async fn create_load_balancer(&self, args: &CreateLoadBalancerArgs) -> Result<LoadBalancer> {
        let url = format!("{}/v1/blb", self.config.blb_endpoint);
        let request = self
            .request(Method::POST, &url)?
            .query(&[("clientToken", args.client_token.to_string())])
            .json(args);
        let created: CreatedLoadBalancer = self.send_json(request).await?;

        tracing::debug!(load_balancer_id = %created.blb_id, name = %created.name, "Created load balancer");

        Ok(LoadBalancer {
            id: created.blb_id,
            name: created.name,
            status: LoadBalancerStatus::Creating,
            address: created.address,
            public_address: None,
            description: created.desc,
            vpc_id: Some(args.vpc_id.clone()),
            subnet_id: Some(args.subnet_id.clone()),
        })
    }

    async fn update_load_balancer(
        &self,
        id: &LoadBalancerId,
        args: &UpdateLoadBalancerArgs,
    ) -> Result<()> {
        let url = format!("{}/v1/blb/{id}", self.config.blb_endpoint);
        self.send_empty(self.request(Method::PUT, &url)?.json(args))
            .await
    }

    async fn delete_load_balancer(&self, id: &LoadBalancerId) -> Result<()> {
        let url = format!("{}/v1/blb/{id}", self.config.blb_endpoint);
        self.send_empty(self.request(Method::DELETE, &url)?).await
    }

    async fn describe_listeners(
        &self,
        id: &LoadBalancerId,
        protocol: Protocol,
    ) -> Result<Vec<Listener>> {
        let url = self.listener_url(id, protocol)?;
        let list: ListenerList = self.send_json(self.request(Method::GET, &url)?).await?;

        Ok(list
            .listener_list
            .into_iter()
            .map(|raw| Listener {
                port: raw.listener_port,
                protocol,
                backend_port: raw.backend_port,
            })
            .collect())
    }

    async fn create_listener(&self, id: &LoadBalancerId, listener: &Listener) -> Result<()> {
        let url = self.listener_url(id, listener.protocol)?;
        let body = ListenerBody {
            listener_port: Some(listener.port),
            backend_port: listener.backend_port,
            scheduler: LISTENER_SCHEDULER,
        };
        self.send_empty(self.request(Method::POST, &url)?.json(&body))
            .await
    }

    async fn update_listener(&self, id: &LoadBalancerId, listener: &Listener) -> Result<()> {
        let url = self.listener_url(id, listener.protocol)?;
        let body = ListenerBody {
            listener_port: None,
            backend_port: listener.backend_port,
            scheduler: LISTENER_SCHEDULER,
        };
        let request = self
            .request(Method::PUT, &url)?
            .query(&[("listenerPort", listener.port)])
            .json(&body);
        self.send_empty(request).await
    }

    async fn delete_listeners(&self, id: &LoadBalancerId, ports: &[u16]) -> Result<()> {
        let url = format!(
            "{}/v1/blb/{id}/listener?batchdelete",
            self.config.blb_endpoint
        );
        let body = PortList { port_list: ports };
        self.send_empty(self.request(Method::PUT, &url)?.json(&body))
            .await
    }

    async fn describe_backends(&self, id: &LoadBalancerId) -> Result<Vec<Backend>> {
        let url = format!("{}/v1/blb/{id}/backendserver", self.config.blb_endpoint);
        let list: BackendList<Backend> = self.send_json(self.request(Method::GET, &url)?).await?;
        Ok(list.backend_server_list)
    }

    async fn add_backends(&self, id: &LoadBalancerId, backends: &[Backend]) -> Result<()> {
        let url = format!("{}/v1/blb/{id}/backendserver", self.config.blb_endpoint);
        let body = BackendList {
            backend_server_list: backends.to_vec(),
        };
        self.send_empty(self.request(Method::POST, &url)?.json(&body))
            .await
    }

    async fn remove_backends(&self, id: &LoadBalancerId, instances: &[InstanceId]) -> Result<()> {
        let url = format!(
            "{}/v1/blb/{id}/backendserver?remove",
            self.config.blb_endpoint
        );
        let body = BackendList {
            backend_server_list: instances.to_vec(),
        };
        self.send_empty(self.request(Method::PUT, &url)?.json(&body))
            .await
    }
}

#[async_trait]
impl EipApi for HttpCloudClient {
    async fn create_eip(&self, args: &CreateEipArgs) -> Result<IpAddr> {
        let url = format!("{}/v1/eip", self.config.eip_endpoint);
        let request = self
            .request(Method::POST, &url)?
            .query(&[("clientToken", args.client_token.to_string())])
            .json(args);
        let created: CreatedEip = self.send_json(request).await?;
        Ok(created.eip)
    }

    async fn bind_eip(&self, address: IpAddr, load_balancer: &LoadBalancerId) -> Result<()> {
        let url = format!("{}/v1/eip/{address}?bind", self.config.eip_endpoint);
        let body = BindBody {
            instance_type: BIND_INSTANCE_TYPE,
            instance_id: load_balancer.as_str(),
        };
        self.send_empty(self.request(Method::PUT, &url)?.json(&body))
            .await
    }

    async fn unbind_eip(&self, address: IpAddr) -> Result<()> {
        let url = format!("{}/v1/eip/{address}?unbind", self.config.eip_endpoint);
        self.send_empty(self.request(Method::PUT, &url)?).await
    }

    async fn resize_eip(&self, address: IpAddr, bandwidth_mbps: u32) -> Result<()> {
        let url = format!("{}/v1/eip/{address}?resize", self.config.eip_endpoint);
        let body = ResizeBody {
            new_bandwidth_in_mbps: bandwidth_mbps,
        };
        self.send_empty(self.request(Method::PUT, &url)?.json(&body))
            .await
    }

    async fn delete_eip(&self, address: IpAddr) -> Result<()> {
        let url = format!("{}/v1/eip/{address}", self.config.eip_endpoint);
        self.send_empty(self.request(Method::DELETE, &url)?).await
    }

    async fn get_eip(&self, address: IpAddr) -> Result<Eip> {
        let url = format!("{}/v1/eip", self.config.eip_endpoint);
        let request = self
            .request(Method::GET, &url)?
            .query(&[("eip", address.to_string())]);
        let list: EipList = self.send_json(request).await?;

        list.eip_list
            .into_iter()
            .find(|eip| eip.address == address)
            .ok_or_else(|| CloudError::NotFound(format!("eip {address}")))
    }

    async fn find_eips_by_name(&self, name: &str) -> Result<Vec<Eip>> {
        let url = format!("{}/v1/eip", self.config.eip_endpoint);
        let request = self
            .request(Method::GET, &url)?
            .query(&[("maxKeys", "1000")]);
        let list: EipList = self.send_json(request).await?;

        Ok(list
            .eip_list
            .into_iter()
            .filter(|eip| eip.name == name)
            .collect())
    }
}

#[async_trait]
impl VpcApi for HttpCloudClient {
    async fn describe_subnet(&self, id: &SubnetId) -> Result<Subnet> {
        let url = format!("{}/v1/subnet/{id}", self.config.vpc_endpoint);
        let envelope: SubnetEnvelope = self.send_json(self.request(Method::GET, &url)?).await?;
        Ok(envelope.subnet)
    }

    async fn list_subnets(&self, vpc: &VpcId) -> Result<Vec<Subnet>> {
        let url = format!("{}/v1/subnet", self.config.vpc_endpoint);
        let request = self
            .request(Method::GET, &url)?
            .query(&[("vpcId", vpc.as_str())]);
        let list: SubnetList = self.send_json(request).await?;
        Ok(list.subnets)
    }

    async fn create_subnet(&self, args: &CreateSubnetArgs) -> Result<SubnetId> {
        let url = format!("{}/v1/subnet", self.config.vpc_endpoint);
        let request = self
            .request(Method::POST, &url)?
            .query(&[("clientToken", args.client_token.to_string())])
            .json(args);
        let created: CreatedSubnet = self.send_json(request).await?;
        Ok(created.subnet_id)
    }

    async fn list_route_tables(&self, vpc: &VpcId) -> Result<Vec<RouteTable>> {
        let url = format!("{}/v1/route", self.config.vpc_endpoint);
        let request = self
            .request(Method::GET, &url)?
            .query(&[("vpcId", vpc.as_str())]);
        // One route table per VPC
        let table: RouteTable = self.send_json(request).await?;
        Ok(vec![table])
    }

    async fn create_route_rule(&self, args: &CreateRouteRuleArgs) -> Result<RouteRuleId> {
        let url = format!("{}/v1/route/rule", self.config.vpc_endpoint);
        let request = self
            .request(Method::POST, &url)?
            .query(&[("clientToken", args.client_token.to_string())])
            .json(args);
        let created: CreatedRouteRule = self.send_json(request).await?;
        Ok(created.route_rule_id)
    }

    async fn delete_route_rule(&self, id: &RouteRuleId) -> Result<()> {
        let url = format!("{}/v1/route/rule/{id}", self.config.vpc_endpoint);
        self.send_empty(self.request(Method::DELETE, &url)?).await
    }
}

#[async_trait]
impl ClusterApi for HttpCloudClient {
    async fn list_nodes(&self, cluster: &ClusterId) -> Result<Vec<ClusterNode>> {
        let url = format!("{}/v1/instance", self.config.cluster_endpoint);
        let request = self
            .request(Method::GET, &url)?
            .query(&[("clusterUuid", cluster.as_str())]);
        let list: InstanceList = self.send_json(request).await?;
        Ok(list.instances)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::StaticCredentialProvider;
    use blb_core::ClientToken;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> HttpCloudClient {
        let config = CloudConfig::with_single_endpoint("bj", server.uri());
        HttpCloudClient::new(config, Arc::new(StaticCredentialProvider::new("test-token")))
            .unwrap()
    }

    fn lb_id() -> LoadBalancerId {
        LoadBalancerId::new("lb-1").unwrap()
    }

    #[tokio::test]
    async fn describe_load_balancer_sends_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/blb/lb-1"))
            .and(header("Authorization", "Bearer test-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "blbId": "lb-1",
                "name": "c-1/default/web",
                "status": "available",
                "address": "192.168.0.5",
                "desc": ""
            })))
            .expect(1)
            .mount(&server)
            .await;

        let lb = client_for(&server)
            .describe_load_balancer(&lb_id())
            .await
            .unwrap();
        assert_eq!(lb.status, LoadBalancerStatus::Available);
        assert_eq!(lb.address, Some("192.168.0.5".parse().unwrap()));
    }

    #[tokio::test]
    async fn missing_load_balancer_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/blb/lb-1"))
            .respond_with(ResponseTemplate::new(404).set_body_json(serde_json::json!({
                "code": "NoSuchObject",
                "message": "blb lb-1 not found"
            })))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .describe_load_balancer(&lb_id())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn server_error_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/blb/lb-1/backendserver"))
            .respond_with(ResponseTemplate::new(503).set_body_string("unavailable"))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .describe_backends(&lb_id())
            .await
            .unwrap_err();
        assert!(matches!(err, CloudError::Transient { status: 503, .. }));
        assert!(err.is_retriable());
    }

    #[tokio::test]
    async fn by_name_filters_prefix_matches() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/blb"))
            .and(query_param("name", "c-1/default/web"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "blbList": [
                    { "blbId": "lb-1", "name": "c-1/default/web" },
                    { "blbId": "lb-2", "name": "c-1/default/web-2" }
                ]
            })))
            .mount(&server)
            .await;

        let found = client_for(&server)
            .describe_load_balancers_by_name("c-1/default/web")
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, lb_id());
    }

    #[tokio::test]
    async fn create_listener_uses_protocol_path() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/blb/lb-1/UDPlistener"))
            .and(body_json(serde_json::json!({
                "listenerPort": 53,
                "backendPort": 30053,
                "scheduler": "RoundRobin"
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let listener = Listener {
            port: 53,
            protocol: Protocol::Udp,
            backend_port: 30053,
        };
        client_for(&server)
            .create_listener(&lb_id(), &listener)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn layer7_listeners_unsupported_without_request() {
        let server = MockServer::start().await;
        let client = client_for(&server);

        let err = client
            .describe_listeners(&lb_id(), Protocol::Https)
            .await
            .unwrap_err();
        assert!(matches!(err, CloudError::Unsupported(_)));
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn describe_listeners_sets_protocol() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/blb/lb-1/TCPlistener"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "listenerList": [ { "listenerPort": 80, "backendPort": 30080 } ]
            })))
            .mount(&server)
            .await;

        let listeners = client_for(&server)
            .describe_listeners(&lb_id(), Protocol::Tcp)
            .await
            .unwrap();
        assert_eq!(
            listeners,
            vec![Listener {
                port: 80,
                protocol: Protocol::Tcp,
                backend_port: 30080
            }]
        );
    }

    #[tokio::test]
    async fn get_eip_absent_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/eip"))
            .and(query_param("eip", "180.76.1.1"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({ "eipList": [] })),
            )
            .mount(&server)
            .await;

        let err = client_for(&server)
            .get_eip("180.76.1.1".parse().unwrap())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn create_eip_returns_address() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/eip"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "eip": "180.76.1.9" })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let args = CreateEipArgs {
            name: "c-1/default/web".to_string(),
            bandwidth_mbps: 100,
            billing: crate::types::Billing {
                payment_timing: crate::types::PaymentTiming::Postpaid,
                billing_method: Some(crate::types::BillingMethod::ByTraffic),
                reservation: None,
            },
            client_token: ClientToken::generate(),
        };
        let address = client_for(&server).create_eip(&args).await.unwrap();
        assert_eq!(address, "180.76.1.9".parse::<IpAddr>().unwrap());
    }

    #[tokio::test]
    async fn route_table_listing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/route"))
            .and(query_param("vpcId", "vpc-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "routeTableId": "rt-1",
                "vpcId": "vpc-1",
                "routeRules": [{
                    "routeRuleId": "rr-1",
                    "routeTableId": "rt-1",
                    "sourceAddress": "0.0.0.0/0",
                    "destinationAddress": "172.16.0.0/24",
                    "nexthopId": "i-1",
                    "nexthopType": "custom",
                    "description": "auto generated by cce"
                }]
            })))
            .mount(&server)
            .await;

        let tables = client_for(&server)
            .list_route_tables(&VpcId::new("vpc-1").unwrap())
            .await
            .unwrap();
        assert_eq!(tables.len(), 1);
        assert_eq!(tables[0].rules.len(), 1);
        assert_eq!(
            tables[0].rules[0].next_hop_type,
            crate::types::NextHopType::Custom
        );
    }
}
