// SPDX-License-Identifier: Apache-2.0
// Copyright Flywall Authors

//! Plan execution over rtnetlink and the [`Reconciler`] implementation the
//! supervisor drives.

use crate::observe::LinkObservation;
use crate::plan::{self, bond_mode_number, InterfacePlan, LinkOp, LinkPlan};
use crate::spec::{DesiredLinks, LinkKind, LinkSpec};
use crate::LinkError;
use async_trait::async_trait;
use futures::TryStreamExt;
use ipnet::IpNet;
use net::{AdminState, InterfaceName};
use recon::{ApplyReport, Reconciler, ResourceOutcome};
use rtnetlink::packet_route::link::{InfoBond, InfoBridge, InfoData};
use rtnetlink::{Handle, LinkBond, LinkBridge, LinkUnspec, LinkVlan};
use tracing::{debug, info, warn};

pub struct LinkReconciler {
    handle: Handle,
}

impl LinkReconciler {
    /// Open a netlink connection of our own; the socket task lives as long
    /// as the process.
    pub fn connect() -> Result<LinkReconciler, LinkError> {
        let (connection, handle, _) = rtnetlink::new_connection()?;
        tokio::spawn(connection);
        Ok(LinkReconciler { handle })
    }

    #[must_use]
    pub fn from_handle(handle: Handle) -> LinkReconciler {
        LinkReconciler { handle }
    }

    async fn index_of(&self, name: &InterfaceName) -> Result<u32, LinkError> {
        let mut links = self
            .handle
            .link()
            .get()
            .match_name(name.to_string())
            .execute();
        match links.try_next().await {
            Ok(Some(message)) => Ok(message.header.index),
            _ => Err(LinkError::NotFound(name.to_string())),
        }
    }

    async fn execute(&self, op: &LinkOp) -> Result<(), LinkError> {
        match op {
            LinkOp::Create(spec) => self.create(spec).await,
            LinkOp::Delete(name) => {
                let index = self.index_of(name).await?;
                self.handle.link().del(index).execute().await?;
                Ok(())
            }
            LinkOp::SetAdmin(name, state) => {
                let index = self.index_of(name).await?;
                let builder = LinkUnspec::new_with_index(index);
                let message = match state {
                    AdminState::Up => builder.up().build(),
                    AdminState::Down => builder.down().build(),
                };
                self.handle.link().set(message).execute().await?;
                Ok(())
            }
            LinkOp::SetMtu(name, mtu) => {
                let index = self.index_of(name).await?;
                self.handle
                    .link()
                    .set(LinkUnspec::new_with_index(index).mtu(mtu.to_u32()).build())
                    .execute()
                    .await?;
                Ok(())
            }
            LinkOp::AddAddress(name, address) => {
                let index = self.index_of(name).await?;
                self.handle
                    .address()
                    .add(index, address.addr(), address.prefix_len())
                    .execute()
                    .await?;
                Ok(())
            }
            LinkOp::DelAddress(name, address) => self.del_address(name, *address).await,
            LinkOp::SetController { member, controller } => {
                self.set_controller(member, controller.as_ref()).await
            }
        }
    }

    async fn create(&self, spec: &LinkSpec) -> Result<(), LinkError> {
        let message = match &spec.kind {
            LinkKind::Vlan { parent, vlan_id } => {
                let parent_index = self.index_of(parent).await?;
                LinkVlan::new(spec.name.as_ref(), parent_index, vlan_id.to_u16()).build()
            }
            LinkKind::Bond { mode, .. } => LinkBond::new(spec.name.as_ref())
                .set_info_data(InfoData::Bond(vec![InfoBond::Mode(
                    bond_mode_number(*mode).into(),
                )]))
                .build(),
            LinkKind::Bridge { vlan_filtering, .. } => LinkBridge::new(spec.name.as_ref())
                .set_info_data(InfoData::Bridge(vec![InfoBridge::VlanFiltering(
                    *vlan_filtering,
                )]))
                .build(),
            // Physical cannot be created; tunnels belong to their owners.
            _ => return Ok(()),
        };
        self.handle.link().add(message).execute().await?;
        Ok(())
    }

    async fn del_address(&self, name: &InterfaceName, address: IpNet) -> Result<(), LinkError> {
        let index = self.index_of(name).await?;
        let mut messages = self
            .handle
            .address()
            .get()
            .set_link_index_filter(index)
            .execute();
        while let Some(message) = messages.try_next().await? {
            use rtnetlink::packet_route::address::AddressAttribute;
            let matches = message.header.prefix_len == address.prefix_len()
                && message.attributes.iter().any(|attribute| {
                    matches!(attribute, AddressAttribute::Address(a) if *a == address.addr())
                });
            if matches {
                self.handle.address().del(message).execute().await?;
                return Ok(());
            }
        }
        Ok(())
    }

    /// Enslaving requires the member link down; it comes back up after.
    async fn set_controller(
        &self,
        member: &InterfaceName,
        controller: Option<&InterfaceName>,
    ) -> Result<(), LinkError> {
        let member_index = self.index_of(member).await?;
        self.handle
            .link()
            .set(LinkUnspec::new_with_index(member_index).down().build())
            .execute()
            .await?;
        let message = match controller {
            Some(controller) => {
                let controller_index = self.index_of(controller).await?;
                LinkUnspec::new_with_index(member_index)
                    .controller(controller_index)
                    .build()
            }
            None => LinkUnspec::new_with_index(member_index)
                .nocontroller()
                .build(),
        };
        self.handle.link().set(message).execute().await?;
        self.handle
            .link()
            .set(LinkUnspec::new_with_index(member_index).up().build())
            .execute()
            .await?;
        Ok(())
    }

    /// Run one interface's ops. Returns the reverse ops for what actually
    /// applied, so partial failures still unwind cleanly.
    async fn apply_entry(
        &self,
        entry: &InterfacePlan,
        report: &mut ApplyReport,
    ) -> Vec<LinkOp> {
        if entry.missing {
            report.record(
                entry.name.clone(),
                ResourceOutcome::Degraded {
                    reason: "physical interface absent".to_string(),
                },
            );
            return Vec::new();
        }
        if entry.forward.is_empty() {
            report.record(entry.name.clone(), ResourceOutcome::Unchanged);
            return Vec::new();
        }

        let mut applied_reverse = Vec::new();
        for (position, op) in entry.forward.iter().enumerate() {
            match self.execute(op).await {
                Ok(()) => {
                    // Reverse ops were paired positionally at diff time.
                    if let Some(reverse) = entry.reverse.get(position) {
                        applied_reverse.push(reverse.clone());
                    }
                }
                Err(error) => {
                    warn!(interface = %entry.name, %error, "link op failed");
                    report.record(
                        entry.name.clone(),
                        ResourceOutcome::Degraded {
                            reason: error.to_string(),
                        },
                    );
                    return applied_reverse;
                }
            }
        }
        report.record(
            entry.name.clone(),
            if entry.recreate {
                ResourceOutcome::Recreated
            } else {
                ResourceOutcome::Converged
            },
        );
        applied_reverse
    }
}

#[async_trait]
impl Reconciler for LinkReconciler {
    type Desired = DesiredLinks;
    type Plan = LinkPlan;
    type Error = LinkError;

    fn name(&self) -> &'static str {
        "links"
    }

    async fn diff(&self, desired: &DesiredLinks) -> Result<LinkPlan, LinkError> {
        let observation = LinkObservation::dump(&self.handle).await?;
        let plan = plan::diff(desired, &observation);
        debug!(ops = plan.op_count(), "link plan computed");
        Ok(plan)
    }

    async fn apply(&self, plan: LinkPlan) -> Result<(LinkPlan, ApplyReport), LinkError> {
        let mut report = ApplyReport::new(self.name());
        let mut reverse = LinkPlan::default();

        for entry in plan.removals.iter().chain(plan.changes.iter()) {
            let applied = self.apply_entry(entry, &mut report).await;
            if !applied.is_empty() {
                // Undo in the opposite order the ops landed.
                reverse.changes.push(InterfacePlan {
                    name: entry.name.clone(),
                    forward: applied.into_iter().rev().collect(),
                    reverse: Vec::new(),
                    recreate: false,
                    missing: false,
                });
            }
        }
        // Unwind newest first.
        reverse.changes.reverse();
        info!(
            converged = report.outcomes.len(),
            degraded = report.degraded().count(),
            "link apply finished"
        );
        Ok((reverse, report))
    }

    async fn rollback(&self, reverse: LinkPlan) -> Result<(), LinkError> {
        for entry in reverse.removals.iter().chain(reverse.changes.iter()) {
            for op in &entry.forward {
                if let Err(error) = self.execute(op).await {
                    // Best effort: reconcilers are idempotent, the next apply
                    // converges whatever could not be unwound here.
                    warn!(interface = %entry.name, %error, "rollback op failed");
                }
            }
        }
        Ok(())
    }
}
