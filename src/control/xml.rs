//! libvirt XML rendering for domains and networks

use std::fmt::Write;

use crate::planner::graph::{InterfaceDef, NetworkDef, VmDefinition};
use crate::config::StorageBackend;

/// Offsets of the dynamic DHCP range; node leases start above it
const DHCP_RANGE: (u32, u32) = (2, 9);

fn escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('\'', "&apos;")
        .replace('"', "&quot;")
}

// ============================================================================
// SBIO: Pure rendering (no I/O)
// ============================================================================

/// Domain XML for `virsh define`
pub fn render_domain_xml(vm: &VmDefinition) -> String {
    let driver_type = match vm.disk_format {
        StorageBackend::Qcow2 => "qcow2",
        StorageBackend::Raw => "raw",
    };

    let mut xml = String::new();
    let _ = writeln!(xml, "<domain type='kvm'>");
    let _ = writeln!(xml, "  <name>{}</name>", escape(&vm.name));
    let _ = writeln!(xml, "  <memory unit='MiB'>{}</memory>", vm.memory_mb);
    let _ = writeln!(xml, "  <vcpu placement='static'>{}</vcpu>", vm.vcpus);
    let _ = writeln!(xml, "  <os>");
    let _ = writeln!(xml, "    <type arch='x86_64' machine='q35'>hvm</type>");
    let _ = writeln!(xml, "    <boot dev='hd'/>");
    let _ = writeln!(xml, "  </os>");
    let _ = writeln!(xml, "  <features><acpi/><apic/></features>");
    let _ = writeln!(xml, "  <cpu mode='host-passthrough'/>");
    let _ = writeln!(xml, "  <devices>");
    let _ = writeln!(xml, "    <disk type='volume' device='disk'>");
    let _ = writeln!(xml, "      <driver name='qemu' type='{}'/>", driver_type);
    let _ = writeln!(
        xml,
        "      <source pool='{}' volume='{}'/>",
        escape(&vm.pool),
        escape(&vm.volume)
    );
    let _ = writeln!(xml, "      <target dev='vda' bus='virtio'/>");
    let _ = writeln!(xml, "    </disk>");
    for iface in &vm.interfaces {
        render_interface(&mut xml, iface);
    }
    for alloc in &vm.passthrough {
        for function in &alloc.functions {
            // managed='no': functions are already vfio-bound, host state is left alone
            let _ = writeln!(xml, "    <hostdev mode='subsystem' type='pci' managed='no'>");
            let _ = writeln!(
                xml,
                "      <source><address domain='0x{:04x}' bus='0x{:02x}' slot='0x{:02x}' function='0x{:x}'/></source>",
                function.domain, function.bus, function.device, function.function
            );
            let _ = writeln!(xml, "    </hostdev>");
        }
    }
    let _ = writeln!(xml, "    <serial type='pty'/>");
    let _ = writeln!(xml, "    <console type='pty'/>");
    let _ = writeln!(xml, "  </devices>");
    let _ = writeln!(xml, "</domain>");
    xml
}

fn render_interface(xml: &mut String, iface: &InterfaceDef) {
    let _ = writeln!(xml, "    <interface type='network'>");
    let _ = writeln!(xml, "      <source network='{}'/>", escape(&iface.network));
    let _ = writeln!(xml, "      <mac address='{}'/>", iface.mac);
    let _ = writeln!(xml, "      <model type='virtio'/>");
    let _ = writeln!(xml, "    </interface>");
}

/// Network XML for `virsh net-define`; node leases are added per VM
pub fn render_network_xml(net: &NetworkDef) -> String {
    let mut xml = String::new();
    let _ = writeln!(xml, "<network>");
    let _ = writeln!(xml, "  <name>{}</name>", escape(&net.name));
    let _ = writeln!(xml, "  <forward mode='nat'/>");
    let _ = writeln!(
        xml,
        "  <bridge name='{}' stp='on' delay='0'/>",
        escape(&net.bridge)
    );
    let _ = writeln!(
        xml,
        "  <ip address='{}' netmask='{}'>",
        net.gateway,
        net.subnet.netmask()
    );
    if let (Some(start), Some(end)) = (net.subnet.host(DHCP_RANGE.0), net.subnet.host(DHCP_RANGE.1)) {
        let _ = writeln!(xml, "    <dhcp>");
        let _ = writeln!(xml, "      <range start='{}' end='{}'/>", start, end);
        let _ = writeln!(xml, "    </dhcp>");
    }
    let _ = writeln!(xml, "  </ip>");
    let _ = writeln!(xml, "</network>");
    xml
}

/// `<host>` element for `virsh net-update ... ip-dhcp-host`
pub fn render_dhcp_host(vm_name: &str, iface: &InterfaceDef) -> String {
    format!(
        "<host mac='{}' name='{}' ip='{}'/>",
        iface.mac,
        escape(vm_name),
        iface.ip
    )
}
