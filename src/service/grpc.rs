// src/service/grpc.rs

//! Request-dispatch glue: translates the external gRPC surface into
//! resource-service operations. Every reply carries an errno status plus an
//! error message; transport-level errors are reserved for the framework.

use crate::config::Config;
use crate::core::errors::{GwError, SUCCESS_MESSAGE};
use crate::core::model::{
    AddressFamily, AnaState, HostEntry, ListenerEntry, NamespaceEntry, SubsystemEntry,
};
use crate::core::nqn;
use crate::proto::gateway::gateway_server::{Gateway, GatewayServer};
use crate::proto::gateway::{self as pb};
use crate::proto::monitor::monitor_group_server::{MonitorGroup, MonitorGroupServer};
use crate::proto::monitor::{GroupIdReply, GroupIdReq};
use crate::service::namespace::QosLimits;
use crate::service::{admin, CallMode, GatewayService};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::oneshot;
use tonic::transport::{Certificate, Identity, Server, ServerTlsConfig};
use tonic::{Request, Response, Status};
use tracing::{error, info};

fn ok_status() -> pb::ReqStatus {
    pb::ReqStatus {
        status: 0,
        error_message: SUCCESS_MESSAGE.to_string(),
    }
}

fn to_req_status(result: Result<(), GwError>) -> pb::ReqStatus {
    match result {
        Ok(()) => ok_status(),
        Err(e) => pb::ReqStatus {
            status: e.errno(),
            error_message: e.to_string(),
        },
    }
}

fn adrfam_from_pb(adrfam: pb::AddressFamily) -> AddressFamily {
    match adrfam {
        pb::AddressFamily::Ipv4 => AddressFamily::Ipv4,
        pb::AddressFamily::Ipv6 => AddressFamily::Ipv6,
    }
}

fn adrfam_to_pb(adrfam: AddressFamily) -> pb::AddressFamily {
    match adrfam {
        AddressFamily::Ipv4 => pb::AddressFamily::Ipv4,
        AddressFamily::Ipv6 => pb::AddressFamily::Ipv6,
    }
}

fn opt_str(s: String) -> Option<String> {
    (!s.is_empty()).then_some(s)
}

fn opt_nsid(nsid: u32) -> Option<u32> {
    (nsid != 0).then_some(nsid)
}

/// The gateway control-plane service.
pub struct GatewayApi {
    service: Arc<GatewayService>,
}

impl GatewayApi {
    pub fn new(service: Arc<GatewayService>) -> Self {
        Self { service }
    }

    pub fn into_server(self) -> GatewayServer<Self> {
        GatewayServer::new(self)
    }
}

#[tonic::async_trait]
impl Gateway for GatewayApi {
    async fn create_subsystem(
        &self,
        request: Request<pb::CreateSubsystemReq>,
    ) -> Result<Response<pb::ReqStatus>, Status> {
        let req = request.into_inner();
        let entry = SubsystemEntry {
            subsystem_nqn: req.subsystem_nqn,
            serial_number: req.serial_number,
            max_namespaces: req.max_namespaces,
            enable_ha: req.enable_ha,
        };
        let result = self
            .service
            .create_subsystem(entry, CallMode::Authoritative)
            .await;
        Ok(Response::new(to_req_status(result)))
    }

    async fn delete_subsystem(
        &self,
        request: Request<pb::DeleteSubsystemReq>,
    ) -> Result<Response<pb::ReqStatus>, Status> {
        let req = request.into_inner();
        let result = self
            .service
            .delete_subsystem(&req.subsystem_nqn, req.force, CallMode::Authoritative)
            .await;
        Ok(Response::new(to_req_status(result)))
    }

    async fn list_subsystems(
        &self,
        request: Request<pb::ListSubsystemsReq>,
    ) -> Result<Response<pb::SubsystemsInfo>, Status> {
        let req = request.into_inner();
        let result = self
            .service
            .list_subsystems(
                opt_str(req.subsystem_nqn).as_deref(),
                opt_str(req.serial_number).as_deref(),
            )
            .await;
        let reply = match result {
            Ok(subsystems) => pb::SubsystemsInfo {
                status: 0,
                error_message: SUCCESS_MESSAGE.to_string(),
                subsystems: subsystems
                    .into_iter()
                    .map(|s| pb::Subsystem {
                        nqn: s.nqn,
                        enable_ha: s.enable_ha,
                        serial_number: s.serial_number,
                        model_number: s.model_number,
                        min_cntlid: s.min_cntlid,
                        max_cntlid: s.max_cntlid,
                        namespace_count: s.namespace_count,
                        subtype: s.subtype,
                        max_namespaces: s.max_namespaces,
                    })
                    .collect(),
            },
            Err(e) => pb::SubsystemsInfo {
                status: e.errno(),
                error_message: e.to_string(),
                subsystems: vec![],
            },
        };
        Ok(Response::new(reply))
    }

    async fn get_subsystems(
        &self,
        _request: Request<pb::GetSubsystemsReq>,
    ) -> Result<Response<pb::SubsystemsRawInfo>, Status> {
        let reply = match self.service.get_subsystems().await {
            Ok(subsystems) => pb::SubsystemsRawInfo {
                status: 0,
                error_message: SUCCESS_MESSAGE.to_string(),
                subsystems: subsystems
                    .into_iter()
                    .map(|s| pb::SubsystemRaw {
                        nqn: s.nqn,
                        subtype: s.subtype,
                        serial_number: s.serial_number,
                        max_namespaces: s.max_namespaces,
                        min_cntlid: s.min_cntlid,
                        max_cntlid: s.max_cntlid,
                        allow_any_host: s.allow_any_host,
                        namespaces: s
                            .namespaces
                            .into_iter()
                            .map(|n| pb::NamespaceRaw {
                                nsid: n.nsid,
                                bdev_name: n.bdev_name,
                                uuid: n.uuid,
                                anagrpid: n.anagrpid,
                                nonce: n.nonce,
                            })
                            .collect(),
                    })
                    .collect(),
            },
            Err(e) => pb::SubsystemsRawInfo {
                status: e.errno(),
                error_message: e.to_string(),
                subsystems: vec![],
            },
        };
        Ok(Response::new(reply))
    }

    async fn namespace_add(
        &self,
        request: Request<pb::NamespaceAddReq>,
    ) -> Result<Response<pb::NsidStatus>, Status> {
        let req = request.into_inner();
        let entry = NamespaceEntry {
            rbd_pool_name: req.rbd_pool_name,
            rbd_image_name: req.rbd_image_name,
            subsystem_nqn: req.subsystem_nqn,
            nsid: req.nsid,
            block_size: req.block_size,
            uuid: req.uuid,
            size: req.size,
            create_image: req.create_image,
            anagrpid: req.anagrpid,
            force: req.force,
        };
        let reply = match self.service.namespace_add(entry, CallMode::Authoritative).await {
            Ok(nsid) => pb::NsidStatus {
                nsid,
                status: 0,
                error_message: SUCCESS_MESSAGE.to_string(),
            },
            Err(e) => pb::NsidStatus {
                nsid: 0,
                status: e.errno(),
                error_message: e.to_string(),
            },
        };
        Ok(Response::new(reply))
    }

    async fn namespace_delete(
        &self,
        request: Request<pb::NamespaceDeleteReq>,
    ) -> Result<Response<pb::ReqStatus>, Status> {
        let req = request.into_inner();
        let result = self
            .service
            .namespace_delete(
                &req.subsystem_nqn,
                opt_nsid(req.nsid),
                opt_str(req.uuid).as_deref(),
                CallMode::Authoritative,
            )
            .await;
        Ok(Response::new(to_req_status(result)))
    }

    async fn namespace_resize(
        &self,
        request: Request<pb::NamespaceResizeReq>,
    ) -> Result<Response<pb::ReqStatus>, Status> {
        let req = request.into_inner();
        let result = self
            .service
            .namespace_resize(
                &req.subsystem_nqn,
                opt_nsid(req.nsid),
                opt_str(req.uuid).as_deref(),
                req.new_size,
            )
            .await;
        Ok(Response::new(to_req_status(result)))
    }

    async fn namespace_change_load_balancing_group(
        &self,
        request: Request<pb::NamespaceChangeLoadBalancingGroupReq>,
    ) -> Result<Response<pb::ReqStatus>, Status> {
        let req = request.into_inner();
        let result = self
            .service
            .namespace_change_load_balancing_group(
                &req.subsystem_nqn,
                opt_nsid(req.nsid),
                opt_str(req.uuid).as_deref(),
                req.anagrpid,
                CallMode::Authoritative,
            )
            .await;
        Ok(Response::new(to_req_status(result)))
    }

    async fn namespace_set_qos_limits(
        &self,
        request: Request<pb::NamespaceSetQosReq>,
    ) -> Result<Response<pb::ReqStatus>, Status> {
        let req = request.into_inner();
        let limits = QosLimits {
            rw_ios_per_second: req.rw_ios_per_second,
            rw_mbytes_per_second: req.rw_mbytes_per_second,
            r_mbytes_per_second: req.r_mbytes_per_second,
            w_mbytes_per_second: req.w_mbytes_per_second,
        };
        let result = self
            .service
            .namespace_set_qos_limits(
                &req.subsystem_nqn,
                opt_nsid(req.nsid),
                opt_str(req.uuid).as_deref(),
                limits,
                CallMode::Authoritative,
            )
            .await;
        Ok(Response::new(to_req_status(result)))
    }

    async fn namespace_get_io_stats(
        &self,
        request: Request<pb::NamespaceIoStatsReq>,
    ) -> Result<Response<pb::NamespaceIoStatsInfo>, Status> {
        let req = request.into_inner();
        let result = self
            .service
            .namespace_get_io_stats(
                &req.subsystem_nqn,
                opt_nsid(req.nsid),
                opt_str(req.uuid).as_deref(),
            )
            .await;
        let reply = match result {
            Ok(stats) => pb::NamespaceIoStatsInfo {
                status: 0,
                error_message: SUCCESS_MESSAGE.to_string(),
                subsystem_nqn: stats.subsystem_nqn,
                nsid: stats.nsid,
                uuid: stats.uuid,
                bdev_name: stats.bdev_name,
                tick_rate: stats.tick_rate,
                ticks: stats.ticks,
                bytes_read: stats.bytes_read,
                num_read_ops: stats.num_read_ops,
                bytes_written: stats.bytes_written,
                num_write_ops: stats.num_write_ops,
                bytes_unmapped: stats.bytes_unmapped,
                num_unmap_ops: stats.num_unmap_ops,
                read_latency_ticks: stats.read_latency_ticks,
                max_read_latency_ticks: stats.max_read_latency_ticks,
                min_read_latency_ticks: stats.min_read_latency_ticks,
                write_latency_ticks: stats.write_latency_ticks,
                max_write_latency_ticks: stats.max_write_latency_ticks,
                min_write_latency_ticks: stats.min_write_latency_ticks,
                unmap_latency_ticks: stats.unmap_latency_ticks,
                max_unmap_latency_ticks: stats.max_unmap_latency_ticks,
                min_unmap_latency_ticks: stats.min_unmap_latency_ticks,
                copy_latency_ticks: stats.copy_latency_ticks,
                max_copy_latency_ticks: stats.max_copy_latency_ticks,
                min_copy_latency_ticks: stats.min_copy_latency_ticks,
                io_error: stats.io_error as i32,
            },
            Err(e) => pb::NamespaceIoStatsInfo {
                status: e.errno(),
                error_message: e.to_string(),
                ..Default::default()
            },
        };
        Ok(Response::new(reply))
    }

    async fn list_namespaces(
        &self,
        request: Request<pb::ListNamespacesReq>,
    ) -> Result<Response<pb::NamespacesInfo>, Status> {
        let req = request.into_inner();
        let result = self
            .service
            .list_namespaces(
                &req.subsystem,
                opt_nsid(req.nsid),
                opt_str(req.uuid).as_deref(),
            )
            .await;
        let reply = match result {
            Ok(namespaces) => pb::NamespacesInfo {
                status: 0,
                error_message: SUCCESS_MESSAGE.to_string(),
                subsystem_nqn: req.subsystem,
                namespaces: namespaces
                    .into_iter()
                    .map(|n| pb::Namespace {
                        nsid: n.nsid,
                        bdev_name: n.bdev_name,
                        uuid: n.uuid,
                        load_balancing_group: n.load_balancing_group,
                        rbd_pool_name: n.rbd_pool_name,
                        rbd_image_name: n.rbd_image_name,
                        block_size: n.block_size,
                        rbd_image_size: n.rbd_image_size,
                        rw_ios_per_second: n.rw_ios_per_second,
                        rw_mbytes_per_second: n.rw_mbytes_per_second,
                        r_mbytes_per_second: n.r_mbytes_per_second,
                        w_mbytes_per_second: n.w_mbytes_per_second,
                    })
                    .collect(),
            },
            Err(e) => pb::NamespacesInfo {
                status: e.errno(),
                error_message: e.to_string(),
                subsystem_nqn: req.subsystem,
                namespaces: vec![],
            },
        };
        Ok(Response::new(reply))
    }

    async fn add_host(
        &self,
        request: Request<pb::AddHostReq>,
    ) -> Result<Response<pb::ReqStatus>, Status> {
        let req = request.into_inner();
        let entry = HostEntry {
            subsystem_nqn: req.subsystem_nqn,
            host_nqn: req.host_nqn,
            psk: req.psk,
            dhchap_key: req.dhchap_key,
            dhchap_ctrlr_key: req.dhchap_ctrlr_key,
        };
        let result = self.service.add_host(entry, CallMode::Authoritative).await;
        Ok(Response::new(to_req_status(result)))
    }

    async fn remove_host(
        &self,
        request: Request<pb::RemoveHostReq>,
    ) -> Result<Response<pb::ReqStatus>, Status> {
        let req = request.into_inner();
        let result = self
            .service
            .remove_host(&req.subsystem_nqn, &req.host_nqn, CallMode::Authoritative)
            .await;
        Ok(Response::new(to_req_status(result)))
    }

    async fn list_hosts(
        &self,
        request: Request<pb::ListHostsReq>,
    ) -> Result<Response<pb::HostsInfo>, Status> {
        let req = request.into_inner();
        let reply = match self.service.list_hosts(&req.subsystem).await {
            Ok(list) => pb::HostsInfo {
                status: 0,
                error_message: SUCCESS_MESSAGE.to_string(),
                allow_any_host: list.allow_any_host,
                subsystem_nqn: req.subsystem,
                hosts: list
                    .hosts
                    .into_iter()
                    .map(|h| pb::Host {
                        nqn: h.nqn,
                        use_psk: h.use_psk,
                        use_dhchap: h.use_dhchap,
                    })
                    .collect(),
            },
            Err(e) => pb::HostsInfo {
                status: e.errno(),
                error_message: e.to_string(),
                allow_any_host: false,
                subsystem_nqn: req.subsystem,
                hosts: vec![],
            },
        };
        Ok(Response::new(reply))
    }

    async fn create_listener(
        &self,
        request: Request<pb::CreateListenerReq>,
    ) -> Result<Response<pb::ReqStatus>, Status> {
        let req = request.into_inner();
        if req.trsvcid == 0 || req.trsvcid > u16::MAX as u32 {
            return Ok(Response::new(pb::ReqStatus {
                status: libc::EINVAL,
                error_message: format!("Invalid port {}", req.trsvcid),
            }));
        }
        let adrfam = adrfam_from_pb(req.adrfam());
        let entry = ListenerEntry {
            nqn: req.nqn,
            gateway_name: req.gateway_name,
            trtype: "TCP".to_string(),
            adrfam,
            traddr: req.traddr,
            trsvcid: req.trsvcid as u16,
            secure: req.secure,
        };
        let result = self
            .service
            .create_listener(entry, CallMode::Authoritative)
            .await;
        Ok(Response::new(to_req_status(result)))
    }

    async fn delete_listener(
        &self,
        request: Request<pb::DeleteListenerReq>,
    ) -> Result<Response<pb::ReqStatus>, Status> {
        let req = request.into_inner();
        if req.trsvcid == 0 || req.trsvcid > u16::MAX as u32 {
            return Ok(Response::new(pb::ReqStatus {
                status: libc::EINVAL,
                error_message: format!("Invalid port {}", req.trsvcid),
            }));
        }
        let adrfam = adrfam_from_pb(req.adrfam());
        let entry = ListenerEntry {
            nqn: req.nqn,
            gateway_name: req.gateway_name,
            trtype: "TCP".to_string(),
            adrfam,
            traddr: req.traddr,
            trsvcid: req.trsvcid as u16,
            secure: false,
        };
        let result = self
            .service
            .delete_listener(entry, req.force, CallMode::Authoritative)
            .await;
        Ok(Response::new(to_req_status(result)))
    }

    async fn list_listeners(
        &self,
        request: Request<pb::ListListenersReq>,
    ) -> Result<Response<pb::ListenersInfo>, Status> {
        let req = request.into_inner();
        let reply = match self.service.list_listeners(&req.subsystem).await {
            Ok(listeners) => pb::ListenersInfo {
                status: 0,
                error_message: SUCCESS_MESSAGE.to_string(),
                listeners: listeners
                    .into_iter()
                    .map(|l| pb::ListenerInfo {
                        gateway_name: l.gateway_name,
                        trtype: l.trtype,
                        adrfam: adrfam_to_pb(l.adrfam) as i32,
                        traddr: l.traddr,
                        trsvcid: l.trsvcid as u32,
                        secure: l.secure,
                    })
                    .collect(),
            },
            Err(e) => pb::ListenersInfo {
                status: e.errno(),
                error_message: e.to_string(),
                listeners: vec![],
            },
        };
        Ok(Response::new(reply))
    }

    async fn list_connections(
        &self,
        request: Request<pb::ListConnectionsReq>,
    ) -> Result<Response<pb::ConnectionsInfo>, Status> {
        let req = request.into_inner();
        let reply = match self.service.list_connections(&req.subsystem).await {
            Ok(connections) => pb::ConnectionsInfo {
                status: 0,
                error_message: SUCCESS_MESSAGE.to_string(),
                subsystem_nqn: req.subsystem,
                connections: connections
                    .into_iter()
                    .map(|c| pb::Connection {
                        nqn: c.nqn,
                        traddr: c.traddr,
                        trsvcid: c.trsvcid as u32,
                        trtype: c.trtype,
                        adrfam: if c.adrfam == "ipv6" {
                            pb::AddressFamily::Ipv6 as i32
                        } else {
                            pb::AddressFamily::Ipv4 as i32
                        },
                        connected: c.connected,
                        qpairs_count: c.qpairs_count,
                        controller_id: c.controller_id,
                    })
                    .collect(),
            },
            Err(e) => pb::ConnectionsInfo {
                status: e.errno(),
                error_message: e.to_string(),
                subsystem_nqn: req.subsystem,
                connections: vec![],
            },
        };
        Ok(Response::new(reply))
    }

    async fn set_ana_state(
        &self,
        request: Request<pb::AnaInfo>,
    ) -> Result<Response<pb::ReqStatus>, Status> {
        let req = request.into_inner();
        let states = req
            .states
            .into_iter()
            .map(|nas| admin::NqnAnaStates {
                nqn: nas.nqn,
                states: nas
                    .states
                    .iter()
                    .map(|gs| {
                        let state = match gs.state() {
                            pb::AnaState::Optimized => AnaState::Optimized,
                            _ => AnaState::Inaccessible,
                        };
                        (gs.grp_id, state)
                    })
                    .collect(),
            })
            .collect();
        let result = self
            .service
            .set_ana_state(states, CallMode::Authoritative)
            .await;
        Ok(Response::new(to_req_status(result)))
    }

    async fn get_gateway_info(
        &self,
        request: Request<pb::GetGatewayInfoReq>,
    ) -> Result<Response<pb::GatewayInfo>, Status> {
        let req = request.into_inner();
        let info = self.service.get_gateway_info(&req.cli_version);
        Ok(Response::new(pb::GatewayInfo {
            cli_version: info.cli_version,
            version: info.version,
            spdk_version: info.spdk_version,
            name: info.name,
            group: info.group,
            addr: info.addr,
            port: info.port,
            bool_status: info.bool_status,
            status: info.status,
            error_message: info.error_message,
        }))
    }

    async fn set_spdk_nvmf_logs(
        &self,
        request: Request<pb::SetSpdkNvmfLogsReq>,
    ) -> Result<Response<pb::ReqStatus>, Status> {
        let req = request.into_inner();
        let log_level = req
            .log_level
            .and_then(|raw| pb::LogLevel::try_from(raw).ok())
            .map(|l| l.as_str_name().to_string());
        let print_level = req
            .print_level
            .and_then(|raw| pb::LogLevel::try_from(raw).ok())
            .map(|l| l.as_str_name().to_string());
        let result = self
            .service
            .set_spdk_nvmf_logs(
                log_level.as_deref(),
                print_level.as_deref(),
                CallMode::Authoritative,
            )
            .await;
        Ok(Response::new(to_req_status(result)))
    }

    async fn disable_spdk_nvmf_logs(
        &self,
        _request: Request<pb::DisableSpdkNvmfLogsReq>,
    ) -> Result<Response<pb::ReqStatus>, Status> {
        let result = self
            .service
            .disable_spdk_nvmf_logs(CallMode::Authoritative)
            .await;
        Ok(Response::new(to_req_status(result)))
    }

    async fn get_spdk_nvmf_log_flags_and_level(
        &self,
        _request: Request<pb::GetSpdkNvmfLogFlagsAndLevelReq>,
    ) -> Result<Response<pb::SpdkNvmfLogFlagsAndLevelInfo>, Status> {
        let reply = match self.service.get_spdk_nvmf_log_flags_and_level().await {
            Ok(info) => pb::SpdkNvmfLogFlagsAndLevelInfo {
                status: 0,
                error_message: SUCCESS_MESSAGE.to_string(),
                nvmf_log_flags: info
                    .nvmf_log_flags
                    .into_iter()
                    .map(|(name, enabled)| pb::SpdkLogFlagInfo { name, enabled })
                    .collect(),
                log_level: info.log_level,
                log_print_level: info.log_print_level,
            },
            Err(e) => pb::SpdkNvmfLogFlagsAndLevelInfo {
                status: e.errno(),
                error_message: e.to_string(),
                ..Default::default()
            },
        };
        Ok(Response::new(reply))
    }

    async fn set_gateway_log_level(
        &self,
        request: Request<pb::SetGatewayLogLevelReq>,
    ) -> Result<Response<pb::ReqStatus>, Status> {
        let req = request.into_inner();
        let result = self.service.set_gateway_log_level(&req.log_level);
        Ok(Response::new(to_req_status(result)))
    }

    async fn get_gateway_log_level(
        &self,
        _request: Request<pb::GetGatewayLogLevelReq>,
    ) -> Result<Response<pb::GatewayLogLevelInfo>, Status> {
        Ok(Response::new(pb::GatewayLogLevelInfo {
            status: 0,
            error_message: SUCCESS_MESSAGE.to_string(),
            log_level: self.service.get_gateway_log_level(),
        }))
    }
}

/// The one-shot monitor rendezvous: resolves the latch on the first
/// `group_id` call.
pub struct MonitorRendezvous {
    tx: parking_lot::Mutex<Option<oneshot::Sender<u32>>>,
}

impl MonitorRendezvous {
    pub fn new(tx: oneshot::Sender<u32>) -> Self {
        Self {
            tx: parking_lot::Mutex::new(Some(tx)),
        }
    }

    pub fn into_server(self) -> MonitorGroupServer<Self> {
        MonitorGroupServer::new(self)
    }
}

#[tonic::async_trait]
impl MonitorGroup for MonitorRendezvous {
    async fn group_id(
        &self,
        request: Request<GroupIdReq>,
    ) -> Result<Response<GroupIdReply>, Status> {
        let id = request.into_inner().id;
        if id < 0 {
            return Err(Status::invalid_argument("group id must not be negative"));
        }
        if let Some(tx) = self.tx.lock().take() {
            let _ = tx.send(id as u32);
        }
        Ok(Response::new(GroupIdReply {}))
    }
}

/// The gRPC address string of one peer, with IPv6 addresses bracketed
/// before the port is appended.
pub fn gateway_address(config: &Config) -> String {
    format!(
        "{}:{}",
        nqn::escape_address_if_ipv6(&config.gateway.addr),
        config.gateway.port
    )
}

/// The monitor rendezvous listens one port below the gateway port.
pub fn monitor_address(config: &Config) -> String {
    format!(
        "{}:{}",
        nqn::escape_address_if_ipv6(&config.gateway.addr),
        config.gateway.port - 1
    )
}

/// Serves the gateway gRPC surface until `shutdown` resolves, with mTLS
/// termination by the transport when enabled.
pub async fn serve_gateway(
    service: Arc<GatewayService>,
    config: &Config,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), GwError> {
    let address = gateway_address(config);
    let socket_addr: std::net::SocketAddr = address
        .parse()
        .map_err(|e| GwError::InvalidArgument(format!("invalid gateway address {address}: {e}")))?;

    let mut builder = Server::builder();
    if config.gateway.enable_auth {
        info!("mTLS authentication has been enabled");
        let cert = std::fs::read(&config.mtls.server_cert)?;
        let key = std::fs::read(&config.mtls.server_key)?;
        let client_ca = std::fs::read(&config.mtls.client_cert)?;
        let tls = ServerTlsConfig::new()
            .identity(Identity::from_pem(cert, key))
            .client_ca_root(Certificate::from_pem(client_ca));
        builder = builder
            .tls_config(tls)
            .map_err(|e| GwError::Internal(format!("invalid mTLS configuration: {e}")))?;
    }

    info!("Gateway server is listening on {address}");
    builder
        .add_service(GatewayApi::new(service).into_server())
        .serve_with_shutdown(socket_addr, shutdown)
        .await
        .map_err(|e| {
            error!("Gateway gRPC server failed: {e}");
            GwError::Internal(format!("gRPC server failed: {e}"))
        })
}
