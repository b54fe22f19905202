//! Reference child process implementing the procedure-binary contract:
//! `plgpu-loopback [-a <argseg>] [-r <resultseg>] -- <token>...`.
//!
//! It loops its first argument back as the result: a `v:<hex>` token is
//! written as a little-endian word, an `r:<hex>` token copies the varlena
//! carrier out of the argument segment, `__null__` exits with status 1.
//! The integration tests install it through a fake compiler script so the
//! full handler pipeline can run on machines without a device toolchain.

#![cfg(unix)]

use std::ffi::CString;
use std::process::exit;

struct Segment {
    fd: libc::c_int,
    len: usize,
    ptr: *mut u8,
}

fn open_segment(name: &str, writable: bool) -> Segment {
    let c_name = CString::new(name).unwrap_or_else(|_| fail("bad segment name"));
    let flags = if writable { libc::O_RDWR } else { libc::O_RDONLY };
    let fd = unsafe { libc::shm_open(c_name.as_ptr(), flags, 0o600) };
    if fd < 0 {
        fail("shm_open failed");
    }
    let mut stbuf: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut stbuf) } != 0 {
        fail("fstat failed");
    }
    map_segment(fd, stbuf.st_size as usize, writable)
}

fn map_segment(fd: libc::c_int, len: usize, writable: bool) -> Segment {
    let prot = if writable {
        libc::PROT_READ | libc::PROT_WRITE
    } else {
        libc::PROT_READ
    };
    let ptr = unsafe { libc::mmap(std::ptr::null_mut(), len.max(1), prot, libc::MAP_SHARED, fd, 0) };
    if ptr == libc::MAP_FAILED {
        fail("mmap failed");
    }
    Segment {
        fd,
        len,
        ptr: ptr as *mut u8,
    }
}

fn grow_segment(segment: Segment, len: usize) -> Segment {
    if len <= segment.len {
        return segment;
    }
    unsafe {
        libc::munmap(segment.ptr as *mut libc::c_void, segment.len.max(1));
        if libc::ftruncate(segment.fd, len as libc::off_t) != 0 {
            fail("ftruncate failed");
        }
    }
    map_segment(segment.fd, len, true)
}

fn fail(message: &str) -> ! {
    eprintln!("plgpu-loopback: {message}");
    exit(2);
}

fn parse_hex(text: &str) -> u64 {
    u64::from_str_radix(text, 16).unwrap_or_else(|_| fail("bad hex token"))
}

fn main() {
    let mut argbuf_name: Option<String> = None;
    let mut result_name: Option<String> = None;
    let mut tokens: Vec<String> = Vec::new();

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-a" => argbuf_name = args.next(),
            "-r" => result_name = args.next(),
            "--" => {
                tokens.extend(args);
                break;
            }
            _ => fail("unexpected option"),
        }
    }

    let Some(first) = tokens.first() else {
        fail("no argument tokens");
    };
    if first == "__null__" {
        exit(1); // null result
    }

    let result_name = result_name.unwrap_or_else(|| fail("no result segment"));
    let result = open_segment(&result_name, true);

    if let Some(hex) = first.strip_prefix("v:") {
        let word = parse_hex(hex).to_le_bytes();
        if result.len < word.len() {
            fail("result segment too small");
        }
        unsafe {
            std::ptr::copy_nonoverlapping(word.as_ptr(), result.ptr, word.len());
        }
        exit(0);
    }

    if let Some(hex) = first.strip_prefix("r:") {
        let offset = parse_hex(hex) as usize;
        let argbuf_name = argbuf_name.unwrap_or_else(|| fail("no argument segment"));
        let argbuf = open_segment(&argbuf_name, false);
        if offset + 4 > argbuf.len {
            fail("argument offset out of range");
        }
        let source = unsafe { std::slice::from_raw_parts(argbuf.ptr, argbuf.len) };
        let total = u32::from_le_bytes(
            source[offset..offset + 4]
                .try_into()
                .unwrap_or_else(|_| fail("short varlena header")),
        ) as usize;
        if offset + total > argbuf.len {
            fail("varlena out of range");
        }
        let result = grow_segment(result, total);
        unsafe {
            std::ptr::copy_nonoverlapping(source[offset..].as_ptr(), result.ptr, total);
        }
        exit(0);
    }

    if let Some(hex) = first.strip_prefix("g:") {
        // loop the raw handle bytes back as a varlena carrier
        let bytes: Vec<u8> = (0..hex.len() / 2)
            .map(|i| {
                u8::from_str_radix(&hex[2 * i..2 * i + 2], 16)
                    .unwrap_or_else(|_| fail("bad hex token"))
            })
            .collect();
        let total = bytes.len() + 4;
        let result = grow_segment(result, total);
        let carrier = unsafe { std::slice::from_raw_parts_mut(result.ptr, total) };
        carrier[..4].copy_from_slice(&(total as u32).to_le_bytes());
        carrier[4..].copy_from_slice(&bytes);
        exit(0);
    }

    fail("unrecognized argument token");
}
