pub mod logging;

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * KIB;

pub const fn mib(n: u64) -> u64 {
    n * MIB
}

/// Human-friendly rendering for log lines and CLI output.
pub fn format_bytes(bytes: u64) -> String {
    if bytes >= MIB {
        format!("{:.1}MiB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.1}KiB", bytes as f64 / KIB as f64)
    } else {
        format!("{}B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_human_sizes() {
        assert_eq!(format_bytes(512), "512B");
        assert_eq!(format_bytes(2 * KIB), "2.0KiB");
        assert_eq!(format_bytes(mib(50)), "50.0MiB");
    }
}
