//! Pure route-list construction for the connect sequence, factored out so
//! the ordering and contents can be unit tested without spawning any
//! process or touching the OS.

use std::net::Ipv4Addr;

use ipnetwork::Ipv4Network;

use crate::os::RouteSpec;

/// The reserved TUN link the product exclusively owns.
pub const TUN_ADDRESS: Ipv4Addr = Ipv4Addr::new(198, 18, 0, 2);
pub const TUN_GATEWAY: Ipv4Addr = Ipv4Addr::new(198, 18, 0, 1);
pub const TUN_PREFIX: u8 = 24;

/// Step 11: pins the tunnel carrier's own traffic to the physical path so
/// it cannot loop through the tunnel it is itself carrying.
pub fn host_route(server_ip: Ipv4Addr, original_gateway: Ipv4Addr, original_if_index: u32) -> RouteSpec {
    RouteSpec {
        destination: server_ip,
        prefix_length: 32,
        gateway: original_gateway,
        interface_index: original_if_index,
        metric: 1,
    }
}

/// Step 12: one route per configured bypass subnet, plus an explicit
/// loopback route, all via the original physical gateway.
pub fn bypass_routes(
    bypass_subnets: &[Ipv4Network],
    original_gateway: Ipv4Addr,
    original_if_index: u32,
) -> Vec<RouteSpec> {
    let mut routes: Vec<RouteSpec> = bypass_subnets
        .iter()
        .map(|net| RouteSpec {
            destination: net.network(),
            prefix_length: net.prefix(),
            gateway: original_gateway,
            interface_index: original_if_index,
            metric: 0,
        })
        .collect();
    routes.push(RouteSpec {
        destination: Ipv4Addr::new(127, 0, 0, 1),
        prefix_length: 32,
        gateway: original_gateway,
        interface_index: original_if_index,
        metric: 0,
    });
    routes
}

/// Step 14: broadcast/multicast/link-local/TUN-broadcast destinations
/// must never enter the tunnel.
pub fn blackhole_routes(original_gateway: Ipv4Addr, original_if_index: u32) -> Vec<RouteSpec> {
    let entries: [(Ipv4Addr, u8); 4] = [
        (Ipv4Addr::new(255, 255, 255, 255), 32),
        (Ipv4Addr::new(224, 0, 0, 0), 4),
        (Ipv4Addr::new(169, 254, 0, 0), 16),
        (Ipv4Addr::new(198, 18, 0, 255), 32),
    ];
    entries
        .into_iter()
        .map(|(destination, prefix_length)| RouteSpec {
            destination,
            prefix_length,
            gateway: original_gateway,
            interface_index: original_if_index,
            metric: 0,
        })
        .collect()
}

/// Step 15: the tunnel becomes the default route.
pub fn default_tunnel_route(tun_if_index: u32) -> RouteSpec {
    RouteSpec {
        destination: Ipv4Addr::new(0, 0, 0, 0),
        prefix_length: 0,
        gateway: TUN_GATEWAY,
        interface_index: tun_if_index,
        metric: 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bypass_routes_always_includes_explicit_loopback() {
        let routes = bypass_routes(&[], Ipv4Addr::new(192, 168, 1, 1), 4);
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].destination, Ipv4Addr::new(127, 0, 0, 1));
        assert_eq!(routes[0].prefix_length, 32);
    }

    #[test]
    fn bypass_routes_preserves_configured_order_then_loopback() {
        let subnets = vec![
            "192.168.0.0/16".parse().unwrap(),
            "10.0.0.0/8".parse().unwrap(),
        ];
        let routes = bypass_routes(&subnets, Ipv4Addr::new(192, 168, 1, 1), 4);
        assert_eq!(routes.len(), 3);
        assert_eq!(routes[0].prefix_length, 16);
        assert_eq!(routes[1].prefix_length, 8);
        assert_eq!(routes[2].destination, Ipv4Addr::new(127, 0, 0, 1));
    }

    #[test]
    fn blackhole_routes_covers_the_four_reserved_destinations() {
        let routes = blackhole_routes(Ipv4Addr::new(192, 168, 1, 1), 4);
        assert_eq!(routes.len(), 4);
        assert!(routes.iter().any(|r| r.destination == Ipv4Addr::new(224, 0, 0, 0) && r.prefix_length == 4));
    }

    #[test]
    fn default_tunnel_route_uses_reserved_tun_gateway() {
        let route = default_tunnel_route(7);
        assert_eq!(route.destination, Ipv4Addr::new(0, 0, 0, 0));
        assert_eq!(route.gateway, TUN_GATEWAY);
        assert_eq!(route.interface_index, 7);
    }
}
