const NS_PER_S: u64 = 1_000_000_000;

// USER_HZ, the unit of procfs start times.
pub fn ticks_per_second() -> u64 {
    match procfs::ticks_per_second() {
        Ok(n) if n > 0 => n as u64,
        _              => 100,
    }
}

pub fn ns_to_ticks(ns: u64) -> u64 {
    ns / (NS_PER_S / ticks_per_second())
}

pub fn monotonic_ns() -> u64 {
    let mut ts: libc::timespec = unsafe { std::mem::zeroed() };
    match unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) } {
        0 => ts.tv_sec as u64 * NS_PER_S + ts.tv_nsec as u64,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_convert_nanoseconds_to_ticks() {
        let hz = ticks_per_second();
        assert!(hz > 0);
        assert_eq!(ns_to_ticks(NS_PER_S), hz);
        assert_eq!(ns_to_ticks(0), 0);
    }

    #[test]
    fn should_use_kernel_tick_rate() {
        assert_eq!(ticks_per_second(), procfs::ticks_per_second().unwrap() as u64);
    }

    #[test]
    fn should_read_a_monotonic_clock() {
        let a = monotonic_ns();
        let b = monotonic_ns();
        assert!(a > 0);
        assert!(b >= a);
    }
}
