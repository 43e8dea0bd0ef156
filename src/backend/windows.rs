//! Windows driver over `ReadDirectoryChangesW`.
//!
//! The kernel watches a whole directory handle, recursively when asked, and
//! reports named actions, so no watch tree is needed here. A dedicated
//! thread re-arms the overlapped read in a loop and emits straight into the
//! sink; `stop` cancels the outstanding I/O and joins the thread.
//!
//! `FILE_ACTION_MODIFIED` covers content, attribute and timestamp changes
//! alike. The notification filter is narrowed per configured kind so only
//! the requested classes wake the handle, but every such action decodes as
//! a modify event; attribute changes are only distinguishable on the stat
//! driver.
//!
//! A plain-file root is watched through its parent directory with the
//! events narrowed to the file's name, reported under the empty relative
//! path.

use std::ffi::{c_void, OsString};
use std::io;
use std::os::windows::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::task::spawn_blocking;
use tracing::{debug, error, trace};

use windows_sys::Win32::Foundation::{
    CloseHandle, GetLastError, ERROR_OPERATION_ABORTED, HANDLE, INVALID_HANDLE_VALUE,
};
use windows_sys::Win32::Storage::FileSystem::{
    CreateFileW, ReadDirectoryChangesW, FILE_ACTION_ADDED, FILE_ACTION_MODIFIED,
    FILE_ACTION_REMOVED, FILE_ACTION_RENAMED_NEW_NAME, FILE_ACTION_RENAMED_OLD_NAME,
    FILE_FLAG_BACKUP_SEMANTICS, FILE_FLAG_OVERLAPPED, FILE_LIST_DIRECTORY,
    FILE_NOTIFY_CHANGE_ATTRIBUTES, FILE_NOTIFY_CHANGE_DIR_NAME, FILE_NOTIFY_CHANGE_FILE_NAME,
    FILE_NOTIFY_CHANGE_LAST_ACCESS, FILE_NOTIFY_CHANGE_LAST_WRITE, FILE_NOTIFY_CHANGE_SECURITY,
    FILE_NOTIFY_CHANGE_SIZE, FILE_NOTIFY_INFORMATION, FILE_SHARE_DELETE, FILE_SHARE_READ,
    FILE_SHARE_WRITE, OPEN_EXISTING,
};
use windows_sys::Win32::System::Threading::CreateEventW;
use windows_sys::Win32::System::IO::{CancelIoEx, GetOverlappedResult, OVERLAPPED};

use crate::backend::{BackendKind, Driver};
use crate::error::{Error, Result};
use crate::event::{EventKind, FsEvent};
use crate::watcher::{WatchContext, WatcherStatus};

const NOTIFY_BUFFER_LEN: usize = 16 * 1024;
const CANCEL_RETRY: std::time::Duration = std::time::Duration::from_millis(5);

fn notify_mask(ctx: &WatchContext) -> u32 {
    let mut mask = 0;
    for kind in ctx.filter.iter() {
        mask |= match kind {
            EventKind::Access => FILE_NOTIFY_CHANGE_LAST_ACCESS,
            EventKind::Attribute => FILE_NOTIFY_CHANGE_ATTRIBUTES | FILE_NOTIFY_CHANGE_SECURITY,
            EventKind::Create | EventKind::Delete => {
                FILE_NOTIFY_CHANGE_FILE_NAME | FILE_NOTIFY_CHANGE_DIR_NAME
            }
            EventKind::Modify => FILE_NOTIFY_CHANGE_LAST_WRITE | FILE_NOTIFY_CHANGE_SIZE,
        };
    }
    mask
}

fn to_wide(path: &Path) -> Vec<u16> {
    path.as_os_str().encode_wide().chain(Some(0)).collect()
}

/// Handle wrapper so the raw directory handle can cross into the reader
/// thread. All I/O on it is externally synchronized.
struct DirHandle(HANDLE);

unsafe impl Send for DirHandle {}
unsafe impl Sync for DirHandle {}

impl Drop for DirHandle {
    fn drop(&mut self) {
        unsafe { CloseHandle(self.0) };
    }
}

fn open_directory(path: &Path) -> io::Result<DirHandle> {
    let wide = to_wide(path);
    let handle = unsafe {
        CreateFileW(
            wide.as_ptr(),
            FILE_LIST_DIRECTORY,
            FILE_SHARE_READ | FILE_SHARE_WRITE | FILE_SHARE_DELETE,
            ptr::null(),
            OPEN_EXISTING,
            FILE_FLAG_BACKUP_SEMANTICS | FILE_FLAG_OVERLAPPED,
            0,
        )
    };
    if handle == INVALID_HANDLE_VALUE {
        return Err(io::Error::last_os_error());
    }
    Ok(DirHandle(handle))
}

pub(crate) struct WindowsDriver {
    ctx: Arc<WatchContext>,
    handle: Option<Arc<DirHandle>>,
    stop_flag: Option<Arc<AtomicBool>>,
    reader: Option<std::thread::JoinHandle<()>>,
}

impl WindowsDriver {
    pub(crate) fn new(ctx: Arc<WatchContext>) -> Self {
        Self {
            ctx,
            handle: None,
            stop_flag: None,
            reader: None,
        }
    }
}

#[async_trait::async_trait]
impl Driver for WindowsDriver {
    async fn start(&mut self) -> Result<()> {
        // A file root is observed through its parent directory, keeping
        // only records that name the file itself.
        let root_is_dir = self.ctx.root.is_dir();
        let (watch_dir, name_filter) = if root_is_dir {
            (self.ctx.root.clone(), None)
        } else {
            let parent = self
                .ctx
                .root
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| self.ctx.root.clone());
            let name = self.ctx.root.file_name().map(OsString::from);
            (parent, name)
        };

        let handle = Arc::new(open_directory(&watch_dir).map_err(|source| {
            Error::BackendUnavailable {
                backend: BackendKind::Windows,
                source,
            }
        })?);
        debug!(path = %watch_dir.display(), "opened directory handle");

        let stop_flag = Arc::new(AtomicBool::new(false));
        let recursive = root_is_dir && self.ctx.recursive;
        let reader = {
            let ctx = Arc::clone(&self.ctx);
            let handle = Arc::clone(&handle);
            let stop_flag = Arc::clone(&stop_flag);
            std::thread::Builder::new()
                .name("pathwatch-windows".into())
                .spawn(move || read_loop(ctx, handle, recursive, name_filter, stop_flag))
                .map_err(|source| Error::BackendUnavailable {
                    backend: BackendKind::Windows,
                    source,
                })?
        };

        self.handle = Some(handle);
        self.stop_flag = Some(stop_flag);
        self.reader = Some(reader);
        Ok(())
    }

    async fn stop(&mut self) {
        if let Some(flag) = self.stop_flag.take() {
            flag.store(true, Ordering::Relaxed);
        }
        let handle = self.handle.take();
        if let Some(reader) = self.reader.take() {
            let _ = spawn_blocking(move || {
                if let Some(handle) = &handle {
                    // the flag store can race the reader between one
                    // completion and the next arm; keep cancelling until
                    // the reader has observed it and exited
                    while !reader.is_finished() {
                        unsafe { CancelIoEx(handle.0, ptr::null()) };
                        std::thread::sleep(CANCEL_RETRY);
                    }
                }
                reader.join()
            })
            .await;
        }
    }
}

fn read_loop(
    ctx: Arc<WatchContext>,
    handle: Arc<DirHandle>,
    recursive: bool,
    name_filter: Option<OsString>,
    stop: Arc<AtomicBool>,
) {
    let mask = notify_mask(&ctx);
    // DWORD-aligned backing store for the FILE_NOTIFY_INFORMATION chain
    let mut buffer = vec![0u32; NOTIFY_BUFFER_LEN / 4];

    let event = unsafe { CreateEventW(ptr::null(), 1, 0, ptr::null()) };
    if event == 0 {
        report_failure(&ctx, "CreateEventW", io::Error::last_os_error());
        return;
    }

    loop {
        // checked right before arming: a stop that lands after the last
        // completion must not leave a fresh read pending with nothing to
        // cancel it
        if stop.load(Ordering::Relaxed) {
            break;
        }

        let mut overlapped: OVERLAPPED = unsafe { std::mem::zeroed() };
        overlapped.hEvent = event;

        let armed = unsafe {
            ReadDirectoryChangesW(
                handle.0,
                buffer.as_mut_ptr().cast::<c_void>(),
                NOTIFY_BUFFER_LEN as u32,
                recursive as i32,
                mask,
                ptr::null_mut(),
                &mut overlapped,
                None,
            )
        };
        if armed == 0 {
            let err = io::Error::last_os_error();
            if !stop.load(Ordering::Relaxed) {
                report_failure(&ctx, "ReadDirectoryChangesW", err);
            }
            break;
        }

        let mut written = 0u32;
        let completed =
            unsafe { GetOverlappedResult(handle.0, &overlapped, &mut written, 1) };
        if completed == 0 {
            let code = unsafe { GetLastError() };
            if code != ERROR_OPERATION_ABORTED && !stop.load(Ordering::Relaxed) {
                report_failure(&ctx, "GetOverlappedResult", io::Error::last_os_error());
            }
            break;
        }
        if stop.load(Ordering::Relaxed) {
            break;
        }
        if written == 0 {
            // buffer overflow; the kernel dropped the batch
            trace!("notification buffer overflowed");
            continue;
        }

        decode_batch(&ctx, buffer_bytes(&buffer), written as usize, &name_filter);
    }

    unsafe { CloseHandle(event) };
}

fn buffer_bytes(buffer: &[u32]) -> &[u8] {
    unsafe { std::slice::from_raw_parts(buffer.as_ptr().cast::<u8>(), buffer.len() * 4) }
}

fn report_failure(ctx: &WatchContext, call: &str, err: io::Error) {
    error!(call, ?err, "windows backend failed");
    ctx.status
        .send_replace(WatcherStatus::Failed(err.to_string()));
}

/// Walks the `FILE_NOTIFY_INFORMATION` chain. Each record's
/// `NextEntryOffset` is relative to that record, not to the buffer start.
fn decode_batch(ctx: &WatchContext, bytes: &[u8], written: usize, name_filter: &Option<OsString>) {
    const HEADER: usize = std::mem::size_of::<FILE_NOTIFY_INFORMATION>();
    let mut offset = 0usize;

    loop {
        if offset + HEADER > written {
            trace!(offset, written, "truncated notification record");
            break;
        }
        let record =
            unsafe { ptr::read_unaligned(bytes[offset..].as_ptr().cast::<FILE_NOTIFY_INFORMATION>()) };
        let name_off = offset + std::mem::offset_of!(FILE_NOTIFY_INFORMATION, FileName);
        let name_len = record.FileNameLength as usize;
        if name_off + name_len > written {
            trace!(offset, written, "truncated notification name");
            break;
        }

        let mut units = Vec::with_capacity(name_len / 2);
        for chunk in bytes[name_off..name_off + name_len].chunks_exact(2) {
            units.push(u16::from_le_bytes([chunk[0], chunk[1]]));
        }
        let name = PathBuf::from(OsString::from_wide(&units));

        let rel = match name_filter {
            // watching a single file through its parent; everything else
            // in that directory is noise
            Some(filter) => {
                if name.as_os_str() == filter.as_os_str() {
                    Some(PathBuf::new())
                } else {
                    None
                }
            }
            None => Some(name),
        };

        if let Some(rel) = rel {
            match record.Action {
                FILE_ACTION_ADDED | FILE_ACTION_RENAMED_NEW_NAME => {
                    ctx.sink.emit(FsEvent::create(rel));
                }
                FILE_ACTION_REMOVED | FILE_ACTION_RENAMED_OLD_NAME => {
                    ctx.sink.emit(FsEvent::delete(rel));
                }
                FILE_ACTION_MODIFIED => {
                    ctx.sink.emit(FsEvent::modify(rel));
                }
                other => trace!(action = other, "unhandled notification action"),
            }
        }

        if record.NextEntryOffset == 0 {
            break;
        }
        offset += record.NextEntryOffset as usize;
    }
}
