//! Purpose: C ABI bridge for embedding poolprobe inside the host process.
//! Exports: C-callable context/resolve/release/unlisten/lookup functions and free helpers.
//! Role: Live-mode surface: reads and writes the current address space directly.
//! Invariants: Opaque handles; explicit free functions; 0 = ok, -1 = error.
//! Invariants: Error kind codes equal the CLI exit codes for the same kind.
//! Invariants: Addresses handed in must be valid host memory; only null is trapped.
#![allow(clippy::result_large_err)]

use crate::core::bindings::HostContext;
use crate::core::directory::HostDirectory;
use crate::core::error::{Error, ErrorKind, to_exit_code};
use crate::core::listeners;
use crate::core::memory::ProcessMemory;
use crate::core::profile::Profile;
use crate::core::resolver::{Handle, SlotPool};
use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::ptr;

#[repr(C)]
pub struct pp_context {
    context: HostContext,
    memory: ProcessMemory,
    directory: HostDirectory,
}

#[repr(C)]
pub struct pp_error {
    kind: i32,
    message: *mut c_char,
    address: u64,
    has_address: u8,
}

/// Binds `profile_json` (or the built-in profile when null) to the module
/// loaded at `base`.
#[unsafe(no_mangle)]
pub extern "C" fn pp_context_new(
    base: u64,
    profile_json: *const c_char,
    out_ctx: *mut *mut pp_context,
    out_err: *mut *mut pp_error,
) -> i32 {
    if out_ctx.is_null() {
        return fail(
            out_err,
            Error::new(ErrorKind::Usage).with_message("out_ctx is null"),
        );
    }
    let profile = if profile_json.is_null() {
        Profile::builtin()
    } else {
        parse_str(profile_json, "profile_json").and_then(Profile::from_json)
    };
    let context = match profile.and_then(|profile| HostContext::bind(base, profile)) {
        Ok(context) => context,
        Err(err) => return fail(out_err, err),
    };
    let directory = match unsafe { context.host_directory() } {
        Ok(directory) => directory,
        Err(err) => return fail(out_err, err),
    };
    let handle = Box::new(pp_context {
        context,
        memory: unsafe { ProcessMemory::new() },
        directory,
    });
    unsafe {
        *out_ctx = Box::into_raw(handle);
    }
    0
}

#[unsafe(no_mangle)]
pub extern "C" fn pp_context_free(ctx: *mut pp_context) {
    if ctx.is_null() {
        return;
    }
    unsafe {
        drop(Box::from_raw(ctx));
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn pp_function_address(
    ctx: *const pp_context,
    name: *const c_char,
    out_addr: *mut u64,
    out_err: *mut *mut pp_error,
) -> i32 {
    let ctx = match borrow_context(ctx, out_err) {
        Ok(ctx) => ctx,
        Err(code) => return code,
    };
    if let Err(code) = require_out(out_addr, "out_addr", out_err) {
        return code;
    }
    let result = parse_str(name, "name").and_then(|name| ctx.context.address_of(name));
    write_u64_out(out_addr, result, out_err)
}

/// Slot address for `handle` in the pool at `pool`, without writing.
#[unsafe(no_mangle)]
pub extern "C" fn pp_resolve(
    ctx: *const pp_context,
    pool: u64,
    handle: u64,
    out_slot: *mut u64,
    out_err: *mut *mut pp_error,
) -> i32 {
    let ctx = match borrow_context(ctx, out_err) {
        Ok(ctx) => ctx,
        Err(code) => return code,
    };
    if let Err(code) = require_out(out_slot, "out_slot", out_err) {
        return code;
    }
    let result = SlotPool::new(&ctx.memory, &ctx.directory, ctx.context.geometry(), pool)
        .resolve(Handle::new(handle));
    write_u64_out(out_slot, result, out_err)
}

/// Marks the slot for `handle` free and returns its address.
#[unsafe(no_mangle)]
pub extern "C" fn pp_release(
    ctx: *const pp_context,
    pool: u64,
    handle: u64,
    out_slot: *mut u64,
    out_err: *mut *mut pp_error,
) -> i32 {
    let ctx = match borrow_context(ctx, out_err) {
        Ok(ctx) => ctx,
        Err(code) => return code,
    };
    if let Err(code) = require_out(out_slot, "out_slot", out_err) {
        return code;
    }
    let result = SlotPool::new(&ctx.memory, &ctx.directory, ctx.context.geometry(), pool)
        .release(Handle::new(handle));
    write_u64_out(out_slot, result, out_err)
}

#[unsafe(no_mangle)]
pub extern "C" fn pp_unlisten(
    ctx: *const pp_context,
    broadcaster: u64,
    handle: u64,
    out_slot: *mut u64,
    out_err: *mut *mut pp_error,
) -> i32 {
    let ctx = match borrow_context(ctx, out_err) {
        Ok(ctx) => ctx,
        Err(code) => return code,
    };
    if let Err(code) = require_out(out_slot, "out_slot", out_err) {
        return code;
    }
    let result = listeners::unlisten(
        &ctx.memory,
        &ctx.directory,
        ctx.context.geometry(),
        ctx.context.profile().listener_pool_offset,
        broadcaster,
        Handle::new(handle),
    )
    .map(|location| location.slot_address);
    write_u64_out(out_slot, result, out_err)
}

/// Hex SHA-256 of the bound profile; free with [`pp_string_free`].
#[unsafe(no_mangle)]
pub extern "C" fn pp_profile_fingerprint(
    ctx: *const pp_context,
    out_fingerprint: *mut *mut c_char,
    out_err: *mut *mut pp_error,
) -> i32 {
    let ctx = match borrow_context(ctx, out_err) {
        Ok(ctx) => ctx,
        Err(code) => return code,
    };
    if out_fingerprint.is_null() {
        return fail(
            out_err,
            Error::new(ErrorKind::Usage).with_message("out_fingerprint is null"),
        );
    }
    match ctx.context.profile().fingerprint() {
        Ok(fingerprint) => {
            unsafe {
                *out_fingerprint = to_c_string(&fingerprint);
            }
            0
        }
        Err(err) => fail(out_err, err),
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn pp_string_free(value: *mut c_char) {
    if value.is_null() {
        return;
    }
    unsafe {
        drop(CString::from_raw(value));
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn pp_error_free(err: *mut pp_error) {
    if err.is_null() {
        return;
    }
    unsafe {
        let err = Box::from_raw(err);
        if !err.message.is_null() {
            drop(CString::from_raw(err.message));
        }
    }
}

fn borrow_context<'a>(
    ctx: *const pp_context,
    out_err: *mut *mut pp_error,
) -> Result<&'a pp_context, i32> {
    if ctx.is_null() {
        return Err(fail(
            out_err,
            Error::new(ErrorKind::Usage).with_message("ctx is null"),
        ));
    }
    unsafe { Ok(&*ctx) }
}

fn parse_str<'a>(input: *const c_char, label: &str) -> Result<&'a str, Error> {
    if input.is_null() {
        return Err(Error::new(ErrorKind::Usage).with_message(format!("{label} is null")));
    }
    unsafe { CStr::from_ptr(input) }
        .to_str()
        .map_err(|_| Error::new(ErrorKind::Usage).with_message(format!("{label} is not valid UTF-8")))
}

fn require_out<T>(out: *mut T, label: &str, out_err: *mut *mut pp_error) -> Result<(), i32> {
    if out.is_null() {
        return Err(fail(
            out_err,
            Error::new(ErrorKind::Usage).with_message(format!("{label} is null")),
        ));
    }
    Ok(())
}

// Callers check `out` with `require_out` before doing any memory work.
fn write_u64_out(out: *mut u64, result: Result<u64, Error>, out_err: *mut *mut pp_error) -> i32 {
    match result {
        Ok(value) => {
            unsafe {
                *out = value;
            }
            0
        }
        Err(err) => fail(out_err, err),
    }
}

fn fail(out_err: *mut *mut pp_error, err: Error) -> i32 {
    if out_err.is_null() {
        return -1;
    }
    let error = Box::new(pp_error {
        kind: error_kind_code(err.kind()),
        message: to_c_string(&err.to_string()),
        address: err.address().unwrap_or(0),
        has_address: if err.address().is_some() { 1 } else { 0 },
    });
    unsafe {
        *out_err = Box::into_raw(error);
    }
    -1
}

fn to_c_string(input: &str) -> *mut c_char {
    CString::new(input)
        .map(|s| s.into_raw())
        .unwrap_or(ptr::null_mut())
}

fn error_kind_code(kind: ErrorKind) -> i32 {
    to_exit_code(kind)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: u64 = 0x1_4000_0000;

    fn new_context() -> *mut pp_context {
        let mut ctx = ptr::null_mut();
        let mut err = ptr::null_mut();
        assert_eq!(pp_context_new(BASE, ptr::null(), &mut ctx, &mut err), 0);
        assert!(err.is_null());
        ctx
    }

    fn take_error(err: *mut pp_error) -> (i32, String, Option<u64>) {
        assert!(!err.is_null());
        let out = unsafe {
            let error = &*err;
            let message = CStr::from_ptr(error.message).to_string_lossy().into_owned();
            let address = (error.has_address == 1).then_some(error.address);
            (error.kind, message, address)
        };
        pp_error_free(err);
        out
    }

    #[test]
    fn function_lookup_uses_base_plus_offset() {
        let ctx = new_context();
        let name = CString::new("PoolFindItem").expect("name");
        let mut address = 0;
        let mut err = ptr::null_mut();
        assert_eq!(pp_function_address(ctx, name.as_ptr(), &mut address, &mut err), 0);
        assert_eq!(address, BASE + 0x2ca9e0);

        let missing = CString::new("NoSuchFunction").expect("name");
        assert_eq!(pp_function_address(ctx, missing.as_ptr(), &mut address, &mut err), -1);
        let (kind, message, _) = take_error(err);
        assert_eq!(kind, 3);
        assert!(message.contains("NoSuchFunction"));
        pp_context_free(ctx);
    }

    #[test]
    fn block_zero_release_patches_live_memory() {
        let ctx = new_context();
        // Pool header words: [1] block 0 pointer, [5] capacity.
        let mut block = vec![0u64; (16 + 8 * 80) / 8 + 1];
        let block_base = block.as_mut_ptr() as u64;
        let mut header = [0u64; 8];
        header[1] = block_base;
        header[5] = 8;
        let pool = header.as_mut_ptr() as u64;

        let data_start = block_base + 16;
        let expected = data_start + (data_start.wrapping_neg() & 7) + 3 * 80;
        let mut slot = 0;
        let mut err = ptr::null_mut();
        assert_eq!(pp_resolve(ctx, pool, 3, &mut slot, &mut err), 0);
        assert_eq!(slot, expected);
        assert_eq!(pp_release(ctx, pool, 3, &mut slot, &mut err), 0);
        let word = unsafe { ptr::read_unaligned((expected + 12) as usize as *const u32) };
        assert_eq!(word & 1, 1);
        pp_context_free(ctx);
    }

    #[test]
    fn null_out_slot_fails_before_release_writes() {
        let ctx = new_context();
        let mut block = vec![0u64; (16 + 8 * 80) / 8 + 1];
        let block_base = block.as_mut_ptr() as u64;
        let mut header = [0u64; 8];
        header[1] = block_base;
        header[5] = 8;
        let pool = header.as_mut_ptr() as u64;

        let data_start = block_base + 16;
        let word_address = data_start + (data_start.wrapping_neg() & 7) + 5 * 80 + 12;
        let mut err = ptr::null_mut();
        assert_eq!(pp_release(ctx, pool, 5, ptr::null_mut(), &mut err), -1);
        let (kind, message, _) = take_error(err);
        assert_eq!(kind, 2);
        assert!(message.contains("out_slot"));
        let word = unsafe { ptr::read_unaligned(word_address as usize as *const u32) };
        assert_eq!(word, 0);
        pp_context_free(ctx);
    }

    #[test]
    fn null_arguments_are_usage_errors() {
        let ctx = new_context();
        let mut err = ptr::null_mut();
        assert_eq!(pp_resolve(ctx, 0x1000, 0, ptr::null_mut(), &mut err), -1);
        assert_eq!(take_error(err).0, 2);

        let mut slot = 0;
        assert_eq!(pp_release(ptr::null(), 0x1000, 0, &mut slot, &mut err), -1);
        assert_eq!(take_error(err).0, 2);

        assert_eq!(pp_unlisten(ctx, 0, 0, &mut slot, &mut err), -1);
        let (kind, _, address) = take_error(err);
        assert_eq!(kind, 4);
        assert_eq!(address, Some(0));
        pp_context_free(ctx);
    }

    #[test]
    fn fingerprint_matches_builtin_profile() {
        let ctx = new_context();
        let mut fingerprint = ptr::null_mut();
        let mut err = ptr::null_mut();
        assert_eq!(pp_profile_fingerprint(ctx, &mut fingerprint, &mut err), 0);
        let value = unsafe { CStr::from_ptr(fingerprint) }.to_string_lossy().into_owned();
        pp_string_free(fingerprint);
        let expected = Profile::builtin()
            .and_then(|profile| profile.fingerprint())
            .expect("fingerprint");
        assert_eq!(value, expected);
        pp_context_free(ctx);
    }

    #[test]
    fn bad_profile_json_is_rejected() {
        let json = CString::new("{\"name\": 1}").expect("json");
        let mut ctx = ptr::null_mut();
        let mut err = ptr::null_mut();
        assert_eq!(pp_context_new(BASE, json.as_ptr(), &mut ctx, &mut err), -1);
        assert!(ctx.is_null());
        assert_eq!(take_error(err).0, 2);
    }
}
