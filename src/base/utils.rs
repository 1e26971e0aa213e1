fn read_float_and_factor_from_env(var: &str) -> Option<(f64, usize)> {
    let mut value = std::env::var(var).ok()?;
    if value.is_empty() {
        return None;
    }

    if value.len() > 1 && (value.ends_with('b') || value.ends_with('B')) {
        value.pop();
    }

    let factor = match value.as_bytes()[value.len() - 1] {
        b'g' | b'G' => 1024 * 1024 * 1024,
        b'm' | b'M' => 1024 * 1024,
        b'k' | b'K' => 1024,
        _ => 1,
    };
    if factor != 1 {
        value.pop();
    }

    value.trim().parse::<f64>().ok().map(|x| (x, factor))
}

/// Reads an unsigned value such as `64`, `4k` or `2M` from the environment.
pub fn read_uint_from_env(var: &str) -> Option<usize> {
    let (value, factor) = read_float_and_factor_from_env(var)?;
    if value < 0.0 {
        return None;
    }

    (value as usize).checked_mul(factor)
}

pub fn read_string_from_env(var: &str) -> Option<String> {
    std::env::var(var).ok()
}

/// Reads a signal given either as a number (`10`) or a name (`SIGUSR1`, `USR1`).
#[cfg(unix)]
pub fn read_signal_from_env(var: &str) -> Option<libc::c_int> {
    let value = read_string_from_env(var)?;
    let value = value.trim();
    if let Ok(num) = value.parse::<libc::c_int>() {
        return Some(num);
    }

    let name = value.to_uppercase();
    let name = name.strip_prefix("SIG").unwrap_or(&name);
    match name {
        "USR1" => Some(libc::SIGUSR1),
        "USR2" => Some(libc::SIGUSR2),
        "XCPU" => Some(libc::SIGXCPU),
        #[cfg(any(target_os = "linux", target_os = "android"))]
        "PWR" => Some(libc::SIGPWR),
        _ => None,
    }
}
