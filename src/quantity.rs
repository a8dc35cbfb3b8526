use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

/* ============================= UNITS ============================= */

/// One mebibyte, the smallest unit the memory hysteresis operates in.
pub const MIB: i64 = 1024 * 1024;

const KIB: i64 = 1024;
const GIB: i64 = 1024 * 1024 * 1024;
const TIB: i64 = 1024 * 1024 * 1024 * 1024;

/* ============================= CPU ============================= */

/// Parse a CPU quantity into millicores.
///
/// Accepts the forms the API server and metrics-server emit:
/// `"250m"`, `"1"`, `"1.5"`, `"407396n"`, `"12345u"`.
///
/// Returns `None` for anything unparseable; callers treat that as an
/// absent value, never as zero.
pub fn parse_cpu_milli(s: &str) -> Option<i64> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }

    if let Some(stripped) = s.strip_suffix('n') {
        let nanos: f64 = stripped.parse().ok()?;
        return Some((nanos / 1_000_000.0).round() as i64);
    }
    if let Some(stripped) = s.strip_suffix('u') {
        let micros: f64 = stripped.parse().ok()?;
        return Some((micros / 1_000.0).round() as i64);
    }
    if let Some(stripped) = s.strip_suffix('m') {
        let milli: f64 = stripped.parse().ok()?;
        return Some(milli.round() as i64);
    }

    let cores: f64 = s.parse().ok()?;
    Some((cores * 1000.0).round() as i64)
}

/// Format millicores as a canonical quantity string.
pub fn format_cpu_milli(milli: i64) -> String {
    format!("{milli}m")
}

/* ============================= MEMORY ============================= */

/// Parse a memory quantity into bytes.
///
/// Accepts plain integers plus binary (`Ki`, `Mi`, `Gi`, `Ti`) and
/// decimal (`k`, `M`, `G`, `T`) suffixes.
pub fn parse_memory_bytes(s: &str) -> Option<i64> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }

    let suffixes: &[(&str, i64)] = &[
        ("Ti", TIB),
        ("Gi", GIB),
        ("Mi", MIB),
        ("Ki", KIB),
        ("T", 1_000_000_000_000),
        ("G", 1_000_000_000),
        ("M", 1_000_000),
        ("k", 1_000),
    ];

    for (suffix, factor) in suffixes {
        if let Some(stripped) = s.strip_suffix(suffix) {
            let value: f64 = stripped.parse().ok()?;
            return Some((value * *factor as f64).round() as i64);
        }
    }

    let bytes: f64 = s.parse().ok()?;
    Some(bytes.round() as i64)
}

/// Format bytes using the largest binary suffix that divides evenly,
/// falling back to a plain byte count.
pub fn format_memory_bytes(bytes: i64) -> String {
    if bytes != 0 && bytes % GIB == 0 {
        format!("{}Gi", bytes / GIB)
    } else if bytes != 0 && bytes % MIB == 0 {
        format!("{}Mi", bytes / MIB)
    } else if bytes != 0 && bytes % KIB == 0 {
        format!("{}Ki", bytes / KIB)
    } else {
        format!("{bytes}")
    }
}

/* ============================= K8S QUANTITY ============================= */

pub fn cpu_quantity(milli: i64) -> Quantity {
    Quantity(format_cpu_milli(milli))
}

pub fn memory_quantity(bytes: i64) -> Quantity {
    Quantity(format_memory_bytes(bytes))
}

pub fn quantity_as_cpu_milli(q: &Quantity) -> Option<i64> {
    parse_cpu_milli(&q.0)
}

pub fn quantity_as_memory_bytes(q: &Quantity) -> Option<i64> {
    parse_memory_bytes(&q.0)
}

/* ============================= TESTS ============================= */
