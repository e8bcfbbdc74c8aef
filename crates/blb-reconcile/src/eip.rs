//! Elastic IP reconciliation.
//!
//! An address is managed under one of two policies, selected by whether the
//! Service pins an address:
//!
//! - **System-allocated**: the controller finds or creates an address named
//!   after the Service, binds it, and keeps its bandwidth in sync. The load
//!   balancer's description records the provenance.
//! - **User-pinned**: the controller only binds and unbinds the given address
//!   and never releases it.
//!
//! A user-supplied load balancer ([`Ownership::User`]) is not ours to label:
//! its description is never written, an address already bound to it is kept
//! as is, and only the address recorded on the Service counts as allocated.
//!
//! At no point are two addresses bound to the same load balancer: a previous
//! address is always unbound before a new one is bound.

use std::net::IpAddr;

use blb_cloud::{
    Billing, CloudError, CreateEipArgs, EipApi, EipStatus, LoadBalancer, LoadBalancerApi,
    PaymentTiming, Reservation, UpdateLoadBalancerArgs,
};
use blb_core::{ClientToken, LoadBalancerId};
use tracing::{debug, info, warn};

use crate::error::{ReconcileError, Result};
use crate::extract::DesiredEipConfig;
use crate::retry::{poll_until, PollPolicy};

/// Description marking a load balancer whose address the controller allocated.
pub const AUTO_CREATED_EIP_DESCRIPTION: &str = "cce_auto_create_eip";

/// Who owns the load balancer whose address is reconciled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// Created by the controller; the description marks an auto-allocated
    /// address.
    Controller,
    /// Supplied by the user.
    User {
        /// The address recorded in the auto-allocation annotation.
        recorded: Option<IpAddr>,
    },
}

impl Ownership {
    /// Whether the bound address was allocated by the controller.
    fn allocated(self, lb: &LoadBalancer) -> bool {
        match self {
            Self::Controller => lb.description == AUTO_CREATED_EIP_DESCRIPTION,
            Self::User { recorded } => recorded.is_some() && recorded == lb.public_address,
        }
    }

    const fn owns_description(self) -> bool {
        matches!(self, Self::Controller)
    }
}

/// The address a load balancer serves once reconciled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundAddress {
    /// The address.
    pub address: IpAddr,
    /// Whether the controller allocated it and releases it on teardown.
    pub allocated: bool,
}

/// Which address to release and how.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressRelease {
    /// The address.
    pub address: IpAddr,
    /// `false` for user-pinned addresses, which are only unbound.
    pub delete: bool,
}

/// Candidate sources for the address to release, in priority order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AddressSources {
    /// Address pinned on the Service spec.
    pub pinned: Option<IpAddr>,
    /// Address recorded in the Service's status.
    pub status: Option<IpAddr>,
    /// Address bound to the load balancer.
    pub load_balancer: Option<IpAddr>,
    /// Address recorded in the stale auto-allocation annotation.
    pub annotation: Option<IpAddr>,
}

impl AddressSources {
    /// The first matching source wins; a pinned address is never deleted.
    #[must_use]
    pub fn locate(&self) -> Option<AddressRelease> {
        if let Some(address) = self.pinned {
            return Some(AddressRelease {
                address,
                delete: false,
            });
        }
        self.status
            .or(self.load_balancer)
            .or(self.annotation)
            .map(|address| AddressRelease {
                address,
                delete: true,
            })
    }
}

/// Reconciles the elastic IP of a load balancer.
pub struct EipReconciler<'a> {
    load_balancers: &'a dyn LoadBalancerApi,
    eips: &'a dyn EipApi,
    poll: PollPolicy,
}

impl<'a> EipReconciler<'a> {
    /// Create a reconciler.
    #[must_use]
    pub fn new(load_balancers: &'a dyn LoadBalancerApi, eips: &'a dyn EipApi, poll: PollPolicy) -> Self {
        Self {
            load_balancers,
            eips,
            poll,
        }
    }

    /// Make the load balancer serve the desired address and return it.
    ///
    /// `lb` must be freshly described.
    ///
    /// # Errors
    ///
    /// Returns `ReconcileError::Conflict` for billing changes that require
    /// recreating the address, and `ReconcileError::Timeout` if an address
    /// never becomes bindable.
    pub async fn ensure_address(
        &self,
        lb: &LoadBalancer,
        desired: &DesiredEipConfig,
        ownership: Ownership,
    ) -> Result<BoundAddress> {
        match desired.pinned_address {
            Some(pinned) => self.ensure_pinned(lb, pinned, ownership).await,
            None => self.ensure_allocated(lb, desired, ownership).await,
        }
    }

    async fn ensure_allocated(
        &self,
        lb: &LoadBalancer,
        desired: &DesiredEipConfig,
        ownership: Ownership,
    ) -> Result<BoundAddress> {
        let auto = ownership.allocated(lb);

        if let Some(bound) = lb.public_address {
            if auto {
                self.sync_billing(bound, desired).await?;
                return Ok(BoundAddress {
                    address: bound,
                    allocated: true,
                });
            }
            if !ownership.owns_description() {
                debug!(load_balancer_id = %lb.id, address = %bound, "Keeping address bound by the load balancer's owner");
                return Ok(BoundAddress {
                    address: bound,
                    allocated: false,
                });
            }
            // Bound to an address the user pinned earlier
            info!(load_balancer_id = %lb.id, address = %bound, "Unbinding previously pinned address");
            self.unbind(bound).await?;
        }

        if ownership.owns_description() && !auto {
            self.set_description(&lb.id, AUTO_CREATED_EIP_DESCRIPTION).await?;
        }

        let address = match self.find_reusable(&lb.id, &desired.name).await? {
            Some(address) => {
                debug!(load_balancer_id = %lb.id, address = %address, "Reusing address from an earlier attempt");
                address
            }
            None => {
                let args = create_args(desired);
                let address = self.eips.create_eip(&args).await?;
                info!(load_balancer_id = %lb.id, address = %address, name = %desired.name, "Created address");
                address
            }
        };

        self.wait_and_bind(address, &lb.id).await?;
        Ok(BoundAddress {
            address,
            allocated: true,
        })
    }

    async fn ensure_pinned(&self, lb: &LoadBalancer, pinned: IpAddr, ownership: Ownership) -> Result<BoundAddress> {
        let auto = ownership.allocated(lb);
        let clear_description = auto && ownership.owns_description();
        let bound = BoundAddress {
            address: pinned,
            allocated: false,
        };

        match lb.public_address {
            Some(current) if current == pinned => {
                debug!(load_balancer_id = %lb.id, address = %pinned, "Pinned address already bound");
                if clear_description {
                    self.set_description(&lb.id, "").await?;
                }
                return Ok(bound);
            }
            Some(current) => {
                info!(load_balancer_id = %lb.id, old = %current, new = %pinned, "Switching bound address");
                self.unbind(current).await?;
                if auto {
                    self.release(AddressRelease {
                        address: current,
                        delete: true,
                    })
                    .await?;
                }
            }
            None => {}
        }

        if clear_description {
            self.set_description(&lb.id, "").await?;
        }

        self.wait_and_bind(pinned, &lb.id).await?;
        Ok(bound)
    }

    async fn sync_billing(&self, address: IpAddr, desired: &DesiredEipConfig) -> Result<()> {
        let eip = self.eips.get_eip(address).await?;

        let method_changed = desired.payment_timing == PaymentTiming::Postpaid
            && eip.billing_method.is_some()
            && eip.billing_method != desired.billing_method;
        if eip.payment_timing != desired.payment_timing || method_changed {
            return Err(ReconcileError::Conflict(format!(
                "address {address}: billing change from {:?}/{:?} to {:?}/{:?} requires deleting and recreating the Service",
                eip.payment_timing, eip.billing_method, desired.payment_timing, desired.billing_method
            )));
        }

        if eip.bandwidth_mbps == desired.bandwidth_mbps {
            debug!(address = %address, "Address billing unchanged");
            return Ok(());
        }

        info!(address = %address, from = eip.bandwidth_mbps, to = desired.bandwidth_mbps, "Resizing address");
        self.eips.resize_eip(address, desired.bandwidth_mbps).await?;
        Ok(())
    }

    async fn find_reusable(&self, lb: &LoadBalancerId, name: &str) -> Result<Option<IpAddr>> {
        let found = self.eips.find_eips_by_name(name).await?;
        Ok(found
            .iter()
            .find(|e| e.instance_id.as_deref() == Some(lb.as_str()))
            .or_else(|| found.iter().find(|e| e.instance_id.is_none()))
            .map(|e| e.address))
    }

    async fn set_description(&self, id: &LoadBalancerId, description: &str) -> Result<()> {
        let args = UpdateLoadBalancerArgs {
            name: None,
            description: Some(description.to_string()),
        };
        self.load_balancers.update_load_balancer(id, &args).await?;
        Ok(())
    }

    async fn unbind(&self, address: IpAddr) -> Result<()> {
        match self.eips.unbind_eip(address).await {
            Ok(()) | Err(CloudError::NotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Wait until the address is bindable, then bind it.
    ///
    /// # Errors
    ///
    /// Returns `ReconcileError::Timeout` if the address never becomes available.
    pub async fn wait_and_bind(&self, address: IpAddr, lb: &LoadBalancerId) -> Result<()> {
        let already_bound = poll_until(self.poll, "elastic IP available for bind", || async move {
            let eip = self.eips.get_eip(address).await?;
            let ready = match eip.status {
                EipStatus::Available => Some(false),
                EipStatus::Bound if eip.instance_id.as_deref() == Some(lb.as_str()) => Some(true),
                status => {
                    debug!(address = %address, status = ?status, "Address not bindable yet");
                    None
                }
            };
            Ok::<_, ReconcileError>(ready)
        })
        .await?;

        if already_bound {
            debug!(load_balancer_id = %lb, address = %address, "Address already bound");
            return Ok(());
        }

        info!(load_balancer_id = %lb, address = %address, "Binding address");
        self.eips.bind_eip(address, lb).await?;
        Ok(())
    }

    /// Unbind an address and, unless it is pinned, release it.
    ///
    /// A missing address counts as released.
    ///
    /// # Errors
    ///
    /// Returns `ReconcileError::Timeout` if the address never becomes
    /// available after unbinding.
    pub async fn release(&self, target: AddressRelease) -> Result<()> {
        let address = target.address;
        let eip = match self.eips.get_eip(address).await {
            Ok(eip) => eip,
            Err(CloudError::NotFound(_)) => {
                debug!(address = %address, "Address already gone");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        if eip.status == EipStatus::Bound || eip.instance_id.is_some() {
            info!(address = %address, "Unbinding address");
            self.unbind(address).await?;
        }

        if !target.delete {
            return Ok(());
        }

        let gone = poll_until(self.poll, "elastic IP available for release", || async move {
            let ready = match self.eips.get_eip(address).await {
                Ok(eip) if eip.status == EipStatus::Available => Some(false),
                Ok(_) => None,
                Err(CloudError::NotFound(_)) => Some(true),
                Err(e) => return Err(ReconcileError::from(e)),
            };
            Ok(ready)
        })
        .await?;
        if gone {
            return Ok(());
        }

        info!(address = %address, "Releasing address");
        match self.eips.delete_eip(address).await {
            Ok(()) | Err(CloudError::NotFound(_)) => Ok(()),
            Err(e) => {
                warn!(address = %address, error = %e, "Failed to release address");
                Err(e.into())
            }
        }
    }

    /// Release the address located through `sources`; a no-op if none is found.
    ///
    /// # Errors
    ///
    /// See [`EipReconciler::release`].
    pub async fn ensure_address_deleted(&self, sources: &AddressSources) -> Result<()> {
        match sources.locate() {
            Some(target) => self.release(target).await,
            None => {
                debug!("No address to release");
                Ok(())
            }
        }
    }
}

fn create_args(desired: &DesiredEipConfig) -> CreateEipArgs {
    CreateEipArgs {
        name: desired.name.clone(),
        bandwidth_mbps: desired.bandwidth_mbps,
        billing: Billing {
            payment_timing: desired.payment_timing,
            billing_method: desired.billing_method,
            reservation: desired
                .reservation_months
                .map(|reservation_length| Reservation { reservation_length }),
        },
        client_token: ClientToken::generate(),
    }
}
