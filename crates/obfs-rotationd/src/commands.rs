//! Shell command builders for port attribute mutations

use obfs_common::shell;

/// Build set VLAN tag command
pub fn build_set_vlan_cmd(iface: &str, tag: u16) -> String {
    format!(
        "{} set port {} tag={}",
        shell::OVS_VSCTL_CMD,
        shell::shellquote(iface),
        tag
    )
}

/// Build clear VLAN tag command
pub fn build_clear_vlan_cmd(iface: &str) -> String {
    format!(
        "{} clear port {} tag",
        shell::OVS_VSCTL_CMD,
        shell::shellquote(iface)
    )
}

/// Build list bridge ports command
pub fn build_list_ports_cmd(bridge: &str) -> String {
    format!(
        "{} list-ports {}",
        shell::OVS_VSCTL_CMD,
        shell::shellquote(bridge)
    )
}

/// Build set hardware address command
pub fn build_set_mac_cmd(iface: &str, mac: &str) -> String {
    format!(
        "{} link set dev {} address {}",
        shell::IP_CMD,
        shell::shellquote(iface),
        shell::shellquote(mac)
    )
}

/// Build link existence check command
pub fn build_link_exists_cmd(iface: &str) -> String {
    format!("{} link show {}", shell::IP_CMD, shell::shellquote(iface))
}

/// Build set ingress policing command
///
/// Rates are in kbps, matching the OVS ingress_policing columns.
pub fn build_set_policing_cmd(iface: &str, rate_kbps: u64, burst_kbps: u64) -> String {
    format!(
        "{} set interface {} ingress_policing_rate={} ingress_policing_burst={}",
        shell::OVS_VSCTL_CMD,
        shell::shellquote(iface),
        rate_kbps,
        burst_kbps
    )
}

/// Build clear ingress policing command
///
/// OVS treats a zero rate as "no policing".
pub fn build_clear_policing_cmd(iface: &str) -> String {
    build_set_policing_cmd(iface, 0, 0)
}

/// Build set egress delay command
pub fn build_set_delay_cmd(iface: &str, delay_ms: u64) -> String {
    format!(
        "{} qdisc replace dev {} root netem delay {}ms",
        shell::TC_CMD,
        shell::shellquote(iface),
        delay_ms
    )
}

/// Build delete root qdisc command
pub fn build_del_qdisc_cmd(iface: &str) -> String {
    format!(
        "{} qdisc del dev {} root",
        shell::TC_CMD,
        shell::shellquote(iface)
    )
}
