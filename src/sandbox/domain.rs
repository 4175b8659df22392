//! Domain description: typed template data rendered to libvirt XML, and
//! the reverse lookup from a live domain's XML to the host-side tap
//! interface for a MAC.

use std::path::PathBuf;

use crate::arch::Arch;
use crate::hypervisor::xml;

/// How the guest boots.
#[derive(Debug, Clone)]
pub enum Boot {
    Bios,
    Kernel {
        kernel: PathBuf,
        initrd: PathBuf,
        cmdline: Option<String>,
    },
}

/// A read-only volume attached as a CD device.
#[derive(Debug, Clone)]
pub struct CdAttachment {
    pub iso_path: PathBuf,
    /// Guest device name, e.g. "sda".
    pub target_dev: String,
    pub bus: String,
}

/// Everything the renderer needs to produce the domain XML.
#[derive(Debug, Clone)]
pub struct DomainTemplate {
    pub name: String,
    pub arch: Arch,
    pub machine: Option<String>,
    pub cpu_model: Option<String>,
    pub vcpus: u32,
    pub ram_mb: u64,
    pub boot: Boot,
    pub overlay_path: PathBuf,
    pub overlay_format: String,
    pub disk_bus: String,
    pub disk_target: String,
    pub cds: Vec<CdAttachment>,
    pub network_name: String,
    pub network_model: String,
    pub mac: String,
}

impl DomainTemplate {
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(2048);
        out.push_str("<domain type='kvm'>\n");
        out.push_str(&format!("  <name>{}</name>\n", self.name));
        out.push_str(&format!("  <memory unit='MiB'>{}</memory>\n", self.ram_mb));
        out.push_str(&format!(
            "  <vcpu placement='static'>{}</vcpu>\n",
            self.vcpus
        ));

        out.push_str("  <os>\n");
        match &self.machine {
            Some(machine) => out.push_str(&format!(
                "    <type arch='{}' machine='{machine}'>hvm</type>\n",
                self.arch
            )),
            None => out.push_str(&format!("    <type arch='{}'>hvm</type>\n", self.arch)),
        }
        if let Boot::Kernel {
            kernel,
            initrd,
            cmdline,
        } = &self.boot
        {
            out.push_str(&format!("    <kernel>{}</kernel>\n", kernel.display()));
            out.push_str(&format!("    <initrd>{}</initrd>\n", initrd.display()));
            if let Some(cmdline) = cmdline {
                out.push_str(&format!("    <cmdline>{cmdline}</cmdline>\n"));
            }
        }
        out.push_str("  </os>\n");

        match self.cpu_model.as_deref() {
            Some("host-passthrough") => out.push_str("  <cpu mode='host-passthrough'/>\n"),
            Some(model) => out.push_str(&format!(
                "  <cpu mode='custom' match='exact'>\n    <model fallback='allow'>{model}</model>\n  </cpu>\n"
            )),
            None => {}
        }

        out.push_str("  <features>\n    <acpi/>\n    <apic/>\n  </features>\n");
        out.push_str("  <on_poweroff>destroy</on_poweroff>\n");
        out.push_str("  <on_reboot>restart</on_reboot>\n");
        out.push_str("  <on_crash>destroy</on_crash>\n");

        out.push_str("  <devices>\n");
        out.push_str(&format!(
            "    <disk type='file' device='disk'>\n      <driver name='qemu' type='{}'/>\n      <source file='{}'/>\n      <target dev='{}' bus='{}'/>\n    </disk>\n",
            self.overlay_format,
            self.overlay_path.display(),
            self.disk_target,
            self.disk_bus,
        ));
        for cd in &self.cds {
            out.push_str(&format!(
                "    <disk type='file' device='cdrom'>\n      <driver name='qemu' type='raw'/>\n      <source file='{}'/>\n      <target dev='{}' bus='{}'/>\n      <readonly/>\n    </disk>\n",
                cd.iso_path.display(),
                cd.target_dev,
                cd.bus,
            ));
        }
        out.push_str(&format!(
            "    <interface type='network'>\n      <mac address='{}'/>\n      <source network='{}'/>\n      <model type='{}'/>\n    </interface>\n",
            self.mac, self.network_name, self.network_model,
        ));
        // The guest-agent channel is the only control path after boot.
        out.push_str(
            "    <channel type='unix'>\n      <target type='virtio' name='org.qemu.guest_agent.0'/>\n    </channel>\n",
        );
        out.push_str("    <serial type='pty'>\n      <target port='0'/>\n    </serial>\n");
        out.push_str("    <console type='pty'/>\n");
        out.push_str("  </devices>\n");
        out.push_str("</domain>\n");
        out
    }
}

/// Walk a live domain's XML for the interface bearing `mac` and return
/// its host-side tap device name.
pub fn tap_interface_for_mac(domain_xml: &str, mac: &str) -> Option<String> {
    for block in xml::element_blocks(domain_xml, "interface") {
        let mac_matches = xml::element_starts(block, "mac")
            .iter()
            .filter_map(|el| xml::attr(el, "address"))
            .any(|a| a.eq_ignore_ascii_case(mac));
        if !mac_matches {
            continue;
        }
        for target in xml::element_starts(block, "target") {
            if let Some(dev) = xml::attr(target, "dev") {
                return Some(dev);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template() -> DomainTemplate {
        DomainTemplate {
            name: "bottle-test".into(),
            arch: Arch::X86_64,
            machine: Some("q35".into()),
            cpu_model: Some("host-passthrough".into()),
            vcpus: 2,
            ram_mb: 1024,
            boot: Boot::Bios,
            overlay_path: "/run/bottle/bottle-test/disk-overlay.qcow2".into(),
            overlay_format: "qcow2".into(),
            disk_bus: "virtio".into(),
            disk_target: "vda".into(),
            cds: vec![CdAttachment {
                iso_path: "/run/bottle/bottle-test/setup.iso".into(),
                target_dev: "sda".into(),
                bus: "sata".into(),
            }],
            network_name: "lab".into(),
            network_model: "virtio".into(),
            mac: "52:54:00:aa:bb:cc".into(),
        }
    }

    #[test]
    fn renders_core_elements() {
        let xml = template().render();
        assert!(xml.contains("<name>bottle-test</name>"));
        assert!(xml.contains("<memory unit='MiB'>1024</memory>"));
        assert!(xml.contains("machine='q35'"));
        assert!(xml.contains("<cpu mode='host-passthrough'/>"));
        assert!(xml.contains("file='/run/bottle/bottle-test/disk-overlay.qcow2'"));
        assert!(xml.contains("dev='sda' bus='sata'"));
        assert!(xml.contains("<source network='lab'/>"));
        assert!(xml.contains("org.qemu.guest_agent.0"));
    }

    #[test]
    fn kernel_boot_adds_kernel_elements() {
        let mut t = template();
        t.boot = Boot::Kernel {
            kernel: "/var/lib/bottle/kernels/vmlinuz".into(),
            initrd: "/var/lib/bottle/kernels/initrd".into(),
            cmdline: Some("console=ttyS0".into()),
        };
        let xml = t.render();
        assert!(xml.contains("<kernel>/var/lib/bottle/kernels/vmlinuz</kernel>"));
        assert!(xml.contains("<initrd>/var/lib/bottle/kernels/initrd</initrd>"));
        assert!(xml.contains("<cmdline>console=ttyS0</cmdline>"));
    }

    #[test]
    fn custom_cpu_model_renders_model_element() {
        let mut t = template();
        t.cpu_model = Some("cortex-a57".into());
        let xml = t.render();
        assert!(xml.contains("<model fallback='allow'>cortex-a57</model>"));
    }

    #[test]
    fn tap_lookup_by_mac() {
        let xml = r#"
<domain>
  <devices>
    <interface type='network'>
      <mac address='52:54:00:AA:BB:CC'/>
      <source network='lab'/>
      <target dev='vnet7'/>
    </interface>
  </devices>
</domain>"#;
        assert_eq!(
            tap_interface_for_mac(xml, "52:54:00:aa:bb:cc").as_deref(),
            Some("vnet7")
        );
        assert_eq!(tap_interface_for_mac(xml, "52:54:00:00:00:00"), None);
    }

    #[test]
    fn rendered_xml_round_trips_through_tap_lookup() {
        let mut xml = template().render();
        // A defined-and-started domain gains the target element.
        xml = xml.replace(
            "<model type='virtio'/>",
            "<model type='virtio'/>\n      <target dev='vnet3'/>",
        );
        assert_eq!(
            tap_interface_for_mac(&xml, "52:54:00:aa:bb:cc").as_deref(),
            Some("vnet3")
        );
    }
}
