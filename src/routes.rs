//! Host route management for the tunnel peer.
//!
//! With `--enable-route` the supervisor adds a host route to the peer's TUN
//! address through the TUN device. The returned guard removes the routes on
//! drop, so cleanup happens even when a session ends abruptly.

use crate::error::{VpnError, VpnResult};
use std::net::Ipv4Addr;

/// Add host routes through the TUN interface.
///
/// Returns a [`RouteGuard`] that removes the routes when dropped. If any
/// route fails to add, previously added routes are rolled back.
pub async fn add_routes(tun_name: &str, routes: &[Ipv4Addr]) -> VpnResult<RouteGuard> {
    let mut added: Vec<Ipv4Addr> = Vec::with_capacity(routes.len());

    for route in routes {
        if let Err(e) = add_route(tun_name, *route).await {
            log::warn!(
                "failed to add route {}, rolling back {} route(s)",
                route,
                added.len()
            );
            for prev in added.iter().rev() {
                remove_route_sync(tun_name, *prev);
            }
            return Err(e);
        }
        added.push(*route);
    }

    Ok(RouteGuard {
        tun_name: tun_name.to_string(),
        routes: added,
    })
}

async fn add_route(tun_name: &str, route: Ipv4Addr) -> VpnResult<()> {
    let output = add_route_command(tun_name, route)
        .output()
        .await
        .map_err(VpnError::Network)?;

    if output.status.success() {
        log::info!("added route {} via {}", route, tun_name);
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    // An already-present route is idempotent success.
    if stderr.contains("File exists") || stderr.contains("exists") {
        log::warn!("route {} already exists, continuing", route);
        return Ok(());
    }

    Err(VpnError::config(format!(
        "failed to add route {} via {}: {}",
        route,
        tun_name,
        stderr.trim()
    )))
}

#[cfg(target_os = "linux")]
fn add_route_command(tun_name: &str, route: Ipv4Addr) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new("ip");
    cmd.args(["route", "add", &format!("{}/32", route), "dev", tun_name]);
    cmd
}

#[cfg(target_os = "macos")]
fn add_route_command(tun_name: &str, route: Ipv4Addr) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new("route");
    cmd.args(["add", "-host", &route.to_string(), "-interface", tun_name]);
    cmd
}

/// Blocking removal for use in `Drop`. Best-effort: failures are logged.
fn remove_route_sync(tun_name: &str, route: Ipv4Addr) {
    #[cfg(target_os = "linux")]
    let result = std::process::Command::new("ip")
        .args(["route", "del", &format!("{}/32", route), "dev", tun_name])
        .output();

    #[cfg(target_os = "macos")]
    let result = std::process::Command::new("route")
        .args(["delete", "-host", &route.to_string(), "-interface", tun_name])
        .output();

    match result {
        Ok(output) if output.status.success() => {
            log::info!("removed route {} via {}", route, tun_name);
        }
        Ok(output) => {
            log::warn!(
                "failed to remove route {}: {}",
                route,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Err(e) => log::warn!("failed to run route removal for {}: {}", route, e),
    }
}

/// Guard that removes its routes when dropped.
pub struct RouteGuard {
    tun_name: String,
    routes: Vec<Ipv4Addr>,
}

impl RouteGuard {
    /// Remove the routes now instead of at drop time.
    pub fn restore(mut self) {
        self.remove_all();
    }

    fn remove_all(&mut self) {
        for route in std::mem::take(&mut self.routes).iter().rev() {
            remove_route_sync(&self.tun_name, *route);
        }
    }
}

impl Drop for RouteGuard {
    fn drop(&mut self) {
        if self.routes.is_empty() {
            return;
        }
        log::info!(
            "cleaning up {} route(s) via {}",
            self.routes.len(),
            self.tun_name
        );
        self.remove_all();
    }
}
