//! Minimal named-variable substitution for instrumentation templates.
//!
//! Supports `{{ .Key }}` (and the unspaced `{{.Key}}`) placeholders and
//! nothing else; multi-line templates render verbatim apart from the
//! substitutions. Unknown placeholders are left untouched so a typo is
//! visible in the rendered output instead of silently vanishing.

/// Expand every known variable in `template`.
pub fn expand(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (key, value) in vars {
        out = out.replace(&format!("{{{{ .{key} }}}}"), value);
        out = out.replace(&format!("{{{{.{key}}}}}"), value);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_spaced_and_unspaced_forms() {
        let vars = [("VmInterface", "vnet3"), ("LogDir", "/var/log/run")];
        assert_eq!(
            expand("tcpdump -i {{ .VmInterface }} -w {{.LogDir}}/cap.pcap", &vars),
            "tcpdump -i vnet3 -w /var/log/run/cap.pcap"
        );
    }

    #[test]
    fn preserves_multiline_templates() {
        let vars = [("VmIp", "10.0.0.4")];
        let rendered = expand("line one\nhost = {{ .VmIp }}\nline three\n", &vars);
        assert_eq!(rendered, "line one\nhost = 10.0.0.4\nline three\n");
    }

    #[test]
    fn unknown_placeholders_stay_visible() {
        assert_eq!(expand("x {{ .Nope }} y", &[]), "x {{ .Nope }} y");
    }

    #[test]
    fn repeated_placeholders_all_expand() {
        let vars = [("C2Ip", "203.0.113.4")];
        assert_eq!(
            expand("{{ .C2Ip }} and {{ .C2Ip }}", &vars),
            "203.0.113.4 and 203.0.113.4"
        );
    }
}
