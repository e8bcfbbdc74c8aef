//! Listener reconciliation.
//!
//! Listeners are keyed by front-end port: one listener per port regardless
//! of protocol. Each desired port is in one of three states:
//!
//! | observed listener            | action               |
//! |------------------------------|----------------------|
//! | absent                       | create               |
//! | same protocol, other backend | update               |
//! | other protocol               | delete, then create  |
//! | identical                    | none                 |
//!
//! Stale ports are deleted in one batch call; creates and updates are issued
//! per port, and a failing port does not stop the others from converging.
//!
//! A protocol change on a port (TCP to UDP, say) cannot be expressed as an
//! update: the cloud's listener update calls are per protocol. The old
//! listener goes out with the batch delete and the new one is created, so
//! the port stops serving traffic between the two calls.

use std::collections::BTreeMap;

use blb_cloud::{CloudError, Listener, LoadBalancerApi, Protocol};
use blb_core::LoadBalancerId;
use tracing::{debug, info, warn};

use crate::error::{ReconcileError, Result};
use crate::extract::PortSpec;

/// Actions computed by [`diff_listeners`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListenerChanges {
    /// Ports to delete in one batch.
    pub to_delete: Vec<u16>,
    /// Listeners to create.
    pub to_create: Vec<Listener>,
    /// Listeners to update in place.
    pub to_update: Vec<Listener>,
}

impl ListenerChanges {
    /// Whether nothing needs to change.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.to_delete.is_empty() && self.to_create.is_empty() && self.to_update.is_empty()
    }
}

/// Compute the listener actions for the desired ports.
#[must_use]
pub fn diff_listeners(observed: &[Listener], desired: &[PortSpec]) -> ListenerChanges {
    let observed: BTreeMap<u16, &Listener> = observed.iter().map(|l| (l.port, l)).collect();
    let desired: BTreeMap<u16, Listener> = desired
        .iter()
        .map(|p| {
            (
                p.port,
                Listener {
                    port: p.port,
                    protocol: p.protocol,
                    backend_port: p.node_port,
                },
            )
        })
        .collect();

    let mut changes = ListenerChanges::default();

    for port in observed.keys() {
        if !desired.contains_key(port) {
            changes.to_delete.push(*port);
        }
    }

    for (port, want) in &desired {
        match observed.get(port) {
            None => changes.to_create.push(*want),
            Some(have) if **have == *want => {}
            Some(have) if have.protocol == want.protocol => changes.to_update.push(*want),
            Some(_) => {
                changes.to_delete.push(*port);
                changes.to_create.push(*want);
            }
        }
    }

    changes.to_delete.sort_unstable();
    changes
}

/// Describe every listener of the load balancer.
///
/// Protocols without listener support are treated as having none.
///
/// # Errors
///
/// Returns the first remote error other than `Unsupported`.
pub async fn describe_all_listeners(
    api: &dyn LoadBalancerApi,
    id: &LoadBalancerId,
) -> Result<Vec<Listener>> {
    let mut listeners = Vec::new();
    for protocol in Protocol::ALL {
        match api.describe_listeners(id, protocol).await {
            Ok(found) => listeners.extend(found),
            Err(CloudError::Unsupported(_)) => {
                // TODO: describe layer-7 listeners once the client supports them.
                debug!(load_balancer_id = %id, protocol = %protocol, "Skipping unsupported listener kind");
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(listeners)
}

fn unsupported(listener: &Listener) -> ReconcileError {
    ReconcileError::Unsupported(format!(
        "{} listener on port {}",
        listener.protocol, listener.port
    ))
}

/// Converge the listeners of a load balancer on the desired ports.
///
/// # Errors
///
/// Every port is attempted; the first error encountered is returned.
pub async fn reconcile_listeners(
    api: &dyn LoadBalancerApi,
    id: &LoadBalancerId,
    desired: &[PortSpec],
) -> Result<ListenerChanges> {
    let observed = describe_all_listeners(api, id).await?;
    let changes = diff_listeners(&observed, desired);

    if changes.is_empty() {
        debug!(load_balancer_id = %id, "Listeners already converged");
        return Ok(changes);
    }

    let mut first_error: Option<ReconcileError> = None;
    let mut record = |err: ReconcileError| {
        if first_error.is_none() {
            first_error = Some(err);
        }
    };

    if !changes.to_delete.is_empty() {
        info!(load_balancer_id = %id, ports = ?changes.to_delete, "Deleting listeners");
        if let Err(e) = api.delete_listeners(id, &changes.to_delete).await {
            warn!(load_balancer_id = %id, error = %e, "Failed to delete listeners");
            record(e.into());
        }
    }

    for listener in &changes.to_update {
        if !listener.protocol.is_supported() {
            record(unsupported(listener));
            continue;
        }
        info!(load_balancer_id = %id, port = listener.port, backend_port = listener.backend_port, "Updating listener");
        if let Err(e) = api.update_listener(id, listener).await {
            warn!(load_balancer_id = %id, port = listener.port, error = %e, "Failed to update listener");
            record(e.into());
        }
    }

    for listener in &changes.to_create {
        if !listener.protocol.is_supported() {
            record(unsupported(listener));
            continue;
        }
        info!(load_balancer_id = %id, port = listener.port, protocol = %listener.protocol, "Creating listener");
        if let Err(e) = api.create_listener(id, listener).await {
            warn!(load_balancer_id = %id, port = listener.port, error = %e, "Failed to create listener");
            record(e.into());
        }
    }

    match first_error {
        Some(err) => Err(err),
        None => Ok(changes),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blb_cloud::{CreateLoadBalancerArgs, MockCloud};
    use blb_core::{ClientToken, SubnetId, VpcId};

    fn spec(port: u16, protocol: Protocol, node_port: u16) -> PortSpec {
        PortSpec {
            port,
            protocol,
            node_port,
        }
    }

    fn listener(port: u16, protocol: Protocol, backend_port: u16) -> Listener {
        Listener {
            port,
            protocol,
            backend_port,
        }
    }

    async fn cloud_with_lb() -> (MockCloud, LoadBalancerId) {
        let cloud = MockCloud::new();
        let lb = cloud
            .create_load_balancer(&CreateLoadBalancerArgs {
                name: "web".into(),
                vpc_id: VpcId::new("vpc-1").unwrap(),
                subnet_id: SubnetId::new("sbn-1").unwrap(),
                description: String::new(),
                client_token: ClientToken::generate(),
            })
            .await
            .unwrap();
        cloud.clear_calls();
        (cloud, lb.id)
    }

    #[test]
    fn diff_covers_every_state() {
        let observed = [
            listener(80, Protocol::Tcp, 30080),
            listener(443, Protocol::Tcp, 30443),
            listener(53, Protocol::Udp, 30053),
            listener(8080, Protocol::Tcp, 30808),
        ];
        let desired = [
            spec(80, Protocol::Tcp, 30080),
            spec(443, Protocol::Tcp, 31443),
            spec(53, Protocol::Tcp, 30053),
            spec(9090, Protocol::Udp, 30909),
        ];

        let changes = diff_listeners(&observed, &desired);
        assert_eq!(changes.to_delete, vec![53, 8080]);
        assert_eq!(changes.to_update, vec![listener(443, Protocol::Tcp, 31443)]);
        assert_eq!(
            changes.to_create,
            vec![
                listener(53, Protocol::Tcp, 30053),
                listener(9090, Protocol::Udp, 30909)
            ]
        );
    }

    #[tokio::test]
    async fn no_calls_when_converged() {
        let (cloud, lb) = cloud_with_lb().await;
        cloud.insert_listener(&lb, listener(80, Protocol::Tcp, 30080));
        cloud.insert_listener(&lb, listener(53, Protocol::Udp, 30053));

        let desired = [spec(80, Protocol::Tcp, 30080), spec(53, Protocol::Udp, 30053)];
        let changes = reconcile_listeners(&cloud, &lb, &desired).await.unwrap();

        assert!(changes.is_empty());
        assert_eq!(cloud.mutation_count(), 0);
    }

    #[tokio::test]
    async fn converges_with_one_batch_delete() {
        let (cloud, lb) = cloud_with_lb().await;
        cloud.insert_listener(&lb, listener(80, Protocol::Tcp, 30080));
        cloud.insert_listener(&lb, listener(81, Protocol::Tcp, 30081));
        cloud.insert_listener(&lb, listener(82, Protocol::Udp, 30082));

        let desired = [spec(80, Protocol::Tcp, 31080), spec(90, Protocol::Udp, 30090)];
        reconcile_listeners(&cloud, &lb, &desired).await.unwrap();

        assert_eq!(cloud.count("delete_listeners"), 1);
        assert_eq!(cloud.count("update_listener"), 1);
        assert_eq!(cloud.count("create_listener"), 1);
        assert_eq!(
            cloud.listeners(&lb),
            vec![
                listener(80, Protocol::Tcp, 31080),
                listener(90, Protocol::Udp, 30090)
            ]
        );
    }

    #[tokio::test]
    async fn protocol_change_replaces_listener() {
        let (cloud, lb) = cloud_with_lb().await;
        cloud.insert_listener(&lb, listener(53, Protocol::Udp, 30053));

        let desired = [spec(53, Protocol::Tcp, 30053)];
        reconcile_listeners(&cloud, &lb, &desired).await.unwrap();

        let ops: Vec<_> = cloud.calls().into_iter().map(|c| c.op).collect();
        assert_eq!(ops.iter().filter(|op| **op == "update_listener").count(), 0);
        let delete = ops.iter().position(|op| *op == "delete_listeners").unwrap();
        let create = ops.iter().position(|op| *op == "create_listener").unwrap();
        assert!(delete < create);
        assert_eq!(cloud.listeners(&lb), vec![listener(53, Protocol::Tcp, 30053)]);
    }

    #[tokio::test]
    async fn unsupported_port_does_not_block_others() {
        let (cloud, lb) = cloud_with_lb().await;

        let desired = [spec(80, Protocol::Http, 30080), spec(53, Protocol::Udp, 30053)];
        let err = reconcile_listeners(&cloud, &lb, &desired).await.unwrap_err();

        assert!(matches!(err, ReconcileError::Unsupported(_)));
        assert_eq!(cloud.listeners(&lb), vec![listener(53, Protocol::Udp, 30053)]);
    }

    #[tokio::test]
    async fn failing_port_does_not_block_others() {
        let (cloud, lb) = cloud_with_lb().await;
        cloud.fail_next(
            "create_listener",
            CloudError::Transient {
                status: 500,
                message: "boom".into(),
            },
        );

        let desired = [spec(53, Protocol::Udp, 30053), spec(80, Protocol::Tcp, 30080)];
        let err = reconcile_listeners(&cloud, &lb, &desired).await.unwrap_err();

        assert!(err.is_retriable());
        assert_eq!(cloud.listeners(&lb).len(), 1);
        assert_eq!(cloud.count("create_listener"), 1);
    }
}
