//! Kernel command line composition.
//!
//! The final command line is base ∪ debug-delta ∪ user-supplied, in
//! that order, serialized as `key=value` pairs joined by spaces.
//! Later parameters win inside the guest, so user parameters are
//! appended last on purpose.

use vpod_shared::config::{HypervisorConfig, Param};

fn base_params() -> Vec<Param> {
    vec![
        Param::new("reboot", "k"),
        Param::new("panic", "1"),
        Param::new("i8042.direct", "1"),
        Param::new("i8042.dumbkbd", "1"),
        Param::new("i8042.nopnp", "1"),
        Param::new("i8042.noaux", "1"),
        Param::new("noreplace-smp", ""),
    ]
}

fn debug_params(debug: bool) -> Vec<Param> {
    if debug {
        vec![Param::new("console", "ttyS0"), Param::new("debug", "")]
    } else {
        vec![Param::new("quiet", "")]
    }
}

/// Compose the full kernel command line for a VM.
pub fn kernel_cmdline(config: &HypervisorConfig) -> String {
    let mut params = base_params();
    params.extend(debug_params(config.debug));
    params.extend(config.kernel_params.iter().cloned());
    serialize_params(&params)
}

pub fn serialize_params(params: &[Param]) -> String {
    params
        .iter()
        .map(|p| {
            if p.value.is_empty() {
                p.key.clone()
            } else {
                format!("{}={}", p.key, p.value)
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialize_params() {
        let params = vec![Param::new("panic", "1"), Param::new("quiet", "")];
        assert_eq!(serialize_params(&params), "panic=1 quiet");
    }

    #[test]
    fn test_user_params_appended_last() {
        let config = HypervisorConfig {
            kernel_params: vec![Param::new("root", "/dev/pmem0")],
            ..Default::default()
        };
        let cmdline = kernel_cmdline(&config);
        assert!(cmdline.starts_with("reboot=k panic=1"));
        assert!(cmdline.ends_with("root=/dev/pmem0"));
        assert!(cmdline.contains("quiet"));
    }

    #[test]
    fn test_debug_replaces_quiet() {
        let config = HypervisorConfig {
            debug: true,
            ..Default::default()
        };
        let cmdline = kernel_cmdline(&config);
        assert!(cmdline.contains("console=ttyS0"));
        assert!(cmdline.contains("debug"));
        assert!(!cmdline.contains("quiet"));
    }
}
