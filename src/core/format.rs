//! Size/time/permission rendering — pure functions, no state.
//!
//! Everything here formats raw `lstat` values for human consumption:
//! byte counts in the 1024 ladder, symbolic `ls -l` permission strings,
//! octal modes and timestamps.

use chrono::{Local, TimeZone};

// ───────────────────────────────────────── sizes ─────────────

const UNITS: &[&str] = &["Bytes", "kB", "MB", "GB", "TB", "PB", "EB", "ZB", "YB"];

/// Human-readable size with one decimal ("4.2 MB", "512 Bytes").
pub fn format_size(bytes: u64) -> String {
    format_size_precision(bytes, 1)
}

/// Human-readable size with a caller-chosen number of decimals.
pub fn format_size_precision(bytes: u64, precision: usize) -> String {
    if bytes < 1024 {
        return format!("{} {}", bytes, UNITS[0]);
    }

    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{size:.precision$} {}", UNITS[unit_index])
}

/// Exact byte count with space-grouped thousands ("12 345 678 Bytes").
pub fn format_byte_size(bytes: u64) -> String {
    let digits = bytes.to_string();
    let mut grouped = String::new();

    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(' ');
        }
        grouped.push(ch);
    }

    format!("{grouped} Bytes")
}

/// One-decimal percentage. Negative input means "not applicable" and
/// renders as the empty string.
pub fn format_percent(percent: f32) -> String {
    if percent < 0.0 {
        return String::new();
    }
    format!("{percent:.1}%")
}

// ───────────────────────────────────────── time ──────────────

/// Local short date-time for an mtime. A zero timestamp renders empty.
pub fn format_time(mtime: i64) -> String {
    if mtime == 0 {
        return String::new();
    }

    match Local.timestamp_opt(mtime, 0) {
        chrono::LocalResult::Single(t) => t.format("%Y-%m-%d %H:%M").to_string(),
        _ => String::new(),
    }
}

/// Elapsed time: "mm:ss"-style above a minute, "s.mmm sec" below.
pub fn format_millisec(millisec: u64) -> String {
    let hours = millisec / 3_600_000;
    let rest = millisec % 3_600_000;
    let min = rest / 60_000;
    let rest = rest % 60_000;
    let sec = rest / 1000;
    let ms = rest % 1000;

    if hours < 1 && min < 1 {
        format!("{sec}.{ms:03} sec")
    } else {
        format!("{hours}:{min:02}:{sec:02}")
    }
}

// ───────────────────────────────────────── permissions ───────

/// `ls -l` style permission string ("drwxr-xr-x") including the
/// setuid/setgid/sticky variants.
pub fn symbolic_mode(mode: u32, omit_type_for_regular_files: bool) -> String {
    let mut result = String::with_capacity(10);

    let type_char = match mode & libc::S_IFMT {
        libc::S_IFDIR => Some('d'),
        libc::S_IFCHR => Some('c'),
        libc::S_IFBLK => Some('b'),
        libc::S_IFIFO => Some('p'),
        libc::S_IFLNK => Some('l'),
        libc::S_IFSOCK => Some('s'),
        _ if omit_type_for_regular_files => None,
        _ => Some('-'),
    };
    result.extend(type_char);

    result.push(if mode & libc::S_IRUSR != 0 { 'r' } else { '-' });
    result.push(if mode & libc::S_IWUSR != 0 { 'w' } else { '-' });
    result.push(if mode & libc::S_ISUID != 0 {
        's'
    } else if mode & libc::S_IXUSR != 0 {
        'x'
    } else {
        '-'
    });

    result.push(if mode & libc::S_IRGRP != 0 { 'r' } else { '-' });
    result.push(if mode & libc::S_IWGRP != 0 { 'w' } else { '-' });
    result.push(if mode & libc::S_ISGID != 0 {
        's'
    } else if mode & libc::S_IXGRP != 0 {
        'x'
    } else {
        '-'
    });

    result.push(if mode & libc::S_IROTH != 0 { 'r' } else { '-' });
    result.push(if mode & libc::S_IWOTH != 0 { 'w' } else { '-' });
    result.push(if mode & libc::S_ISVTX != 0 {
        't'
    } else if mode & libc::S_IXOTH != 0 {
        'x'
    } else {
        '-'
    });

    result
}

/// Octal with a leading zero ("0644").
pub fn format_octal(number: u32) -> String {
    format!("0{number:o}")
}

/// Combined symbolic + octal form like "rwxr-xr-x  0755".
pub fn format_permissions(mode: u32) -> String {
    format!("{}  {}", symbolic_mode(mode, true), format_octal(mode & 0o7777))
}

/// Filesystem object type name from a mode ("Directory", "Socket", ...).
pub fn object_type_name(mode: u32) -> &'static str {
    match mode & libc::S_IFMT {
        libc::S_IFDIR => "Directory",
        libc::S_IFCHR => "Character Device",
        libc::S_IFBLK => "Block Device",
        libc::S_IFIFO => "Named Pipe",
        libc::S_IFLNK => "Symbolic Link",
        libc::S_IFSOCK => "Socket",
        _ => "File",
    }
}

// ───────────────────────────────────────── mode classifiers ──

pub fn is_dir(mode: u32) -> bool {
    mode & libc::S_IFMT == libc::S_IFDIR
}

pub fn is_file(mode: u32) -> bool {
    mode & libc::S_IFMT == libc::S_IFREG
}

pub fn is_symlink(mode: u32) -> bool {
    mode & libc::S_IFMT == libc::S_IFLNK
}

pub fn is_block_device(mode: u32) -> bool {
    mode & libc::S_IFMT == libc::S_IFBLK
}

pub fn is_char_device(mode: u32) -> bool {
    mode & libc::S_IFMT == libc::S_IFCHR
}

pub fn is_fifo(mode: u32) -> bool {
    mode & libc::S_IFMT == libc::S_IFIFO
}

pub fn is_socket(mode: u32) -> bool {
    mode & libc::S_IFMT == libc::S_IFSOCK
}

/// Block/char devices, FIFOs and sockets.
pub fn is_special(mode: u32) -> bool {
    is_block_device(mode) || is_char_device(mode) || is_fifo(mode) || is_socket(mode)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_ladder() {
        assert_eq!(format_size(0), "0 Bytes");
        assert_eq!(format_size(512), "512 Bytes");
        assert_eq!(format_size(1024), "1.0 kB");
        assert_eq!(format_size(1536), "1.5 kB");
        assert_eq!(format_size(1024 * 1024), "1.0 MB");
        assert_eq!(format_size_precision(3 * 1024 * 1024 * 1024 / 2, 2), "1.50 GB");
    }

    #[test]
    fn byte_size_grouping() {
        assert_eq!(format_byte_size(999), "999 Bytes");
        assert_eq!(format_byte_size(1000), "1 000 Bytes");
        assert_eq!(format_byte_size(12_345_678), "12 345 678 Bytes");
    }

    #[test]
    fn percent() {
        assert_eq!(format_percent(42.25), "42.2%");
        assert_eq!(format_percent(-1.0), "");
    }

    #[test]
    fn millisec() {
        assert_eq!(format_millisec(1_500), "1.500 sec");
        assert_eq!(format_millisec(59_999), "59.999 sec");
        assert_eq!(format_millisec(61_000), "0:01:01");
        assert_eq!(format_millisec(3_661_000), "1:01:01");
    }

    #[test]
    fn symbolic_modes() {
        assert_eq!(symbolic_mode(libc::S_IFDIR | 0o755, false), "drwxr-xr-x");
        assert_eq!(symbolic_mode(libc::S_IFREG | 0o644, false), "-rw-r--r--");
        assert_eq!(symbolic_mode(libc::S_IFREG | 0o644, true), "rw-r--r--");
        // setuid + sticky
        assert_eq!(
            symbolic_mode(libc::S_IFREG | 0o4755 | 0o1000, false),
            "-rwsr-xr-t"
        );
        assert_eq!(symbolic_mode(libc::S_IFLNK | 0o777, false), "lrwxrwxrwx");
    }

    #[test]
    fn octal_and_permissions() {
        assert_eq!(format_octal(0o644), "0644");
        assert_eq!(format_permissions(libc::S_IFREG | 0o755), "rwxr-xr-x  0755");
    }

    #[test]
    fn classifiers() {
        assert!(is_dir(libc::S_IFDIR | 0o755));
        assert!(is_file(libc::S_IFREG | 0o644));
        assert!(is_symlink(libc::S_IFLNK | 0o777));
        assert!(is_special(libc::S_IFSOCK));
        assert!(is_special(libc::S_IFIFO));
        assert!(!is_special(libc::S_IFREG));
        assert_eq!(object_type_name(libc::S_IFIFO), "Named Pipe");
    }
}
