//! HTTP response construction.
//!
//! Resolves the request path under the document root, memory-maps regular
//! files for the zero-copy body vector, and writes the status line and
//! headers into the connection's output buffer. Error statuses are served
//! from `/<code>.html` under the root when present, otherwise as a tiny
//! inline HTML body.

use std::ffi::CString;
use std::io;
use std::mem;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use crate::buffer::Buffer;

fn code_status(code: u16) -> &'static str {
    match code {
        200 => "OK",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        _ => "Bad Request",
    }
}

fn code_path(code: u16) -> Option<&'static str> {
    match code {
        400 => Some("/400.html"),
        403 => Some("/403.html"),
        404 => Some("/404.html"),
        _ => None,
    }
}

fn suffix_type(path: &str) -> &'static str {
    let ext = match path.rfind('.') {
        Some(i) => &path[i..],
        None => return "text/plain",
    };
    match ext {
        ".html" => "text/html",
        ".xml" => "text/xml",
        ".xhtml" => "application/xhtml+xml",
        ".txt" => "text/plain",
        ".rtf" => "application/rtf",
        ".pdf" => "application/pdf",
        ".word" => "application/nsword",
        ".png" => "image/png",
        ".gif" => "image/gif",
        ".jpg" | ".jpeg" => "image/jpeg",
        ".au" => "audio/basic",
        ".mpeg" | ".mpg" => "video/mpeg",
        ".avi" => "video/x-msvideo",
        ".gz" => "application/x-gzip",
        ".tar" => "application/x-tar",
        ".css" => "text/css",
        ".js" => "text/javascript",
        _ => "text/plain",
    }
}

/// A read-only, private memory mapping of a served file.
pub struct FileMap {
    ptr: *mut libc::c_void,
    len: usize,
}

// The mapping is immutable bytes with no thread affinity.
unsafe impl Send for FileMap {}

impl FileMap {
    fn map(path: &Path, len: usize) -> io::Result<Self> {
        let cpath = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
        let fd = unsafe { libc::open(cpath.as_ptr(), libc::O_RDONLY) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ,
                libc::MAP_PRIVATE,
                fd,
                0,
            )
        };
        // The mapping keeps its own reference to the file.
        unsafe { libc::close(fd) };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { ptr, len })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr as *const u8, self.len) }
    }
}

impl Drop for FileMap {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr, self.len);
        }
    }
}

pub struct HttpResponse {
    code: u16,
    is_keep_alive: bool,
    path: String,
    src_dir: PathBuf,
    file: Option<FileMap>,
    file_stat: Option<libc::stat>,
}

impl HttpResponse {
    pub fn new() -> Self {
        Self {
            code: 200,
            is_keep_alive: false,
            path: String::new(),
            src_dir: PathBuf::new(),
            file: None,
            file_stat: None,
        }
    }

    /// Prepare for a new response; any previous mapping is released.
    pub fn init(&mut self, src_dir: &Path, path: &str, is_keep_alive: bool, code: u16) {
        self.unmap_file();
        self.code = code;
        self.is_keep_alive = is_keep_alive;
        self.path = path.to_string();
        self.src_dir = src_dir.to_path_buf();
        self.file_stat = None;
    }

    pub fn code(&self) -> u16 {
        self.code
    }

    pub fn is_keep_alive(&self) -> bool {
        self.is_keep_alive
    }

    /// The mapped body, when the target resolved to a regular readable file.
    pub fn file(&self) -> Option<&FileMap> {
        self.file.as_ref()
    }

    pub fn file_len(&self) -> usize {
        self.file.as_ref().map(|f| f.len()).unwrap_or(0)
    }

    /// Safe to call repeatedly.
    pub fn unmap_file(&mut self) {
        self.file = None;
    }

    /// Resolve the target, then emit status line + headers (and an inline
    /// body on error paths without an error page) into `buff`.
    pub fn make_response(&mut self, buff: &mut Buffer) {
        // A parser-assigned error status sticks; otherwise resolve the file.
        if self.code == 200 {
            match stat_path(&self.full_path(&self.path)) {
                Some(st) if st.st_mode & libc::S_IFMT == libc::S_IFDIR => self.code = 404,
                Some(st) if st.st_mode & libc::S_IROTH == 0 => self.code = 403,
                Some(st) => {
                    self.file_stat = Some(st);
                }
                None => self.code = 404,
            }
        }
        self.error_html();
        self.add_state_line(buff);
        self.add_header(buff);
        self.add_content(buff);
    }

    /// Swap the target for the on-disk error page, when one exists.
    fn error_html(&mut self) {
        if let Some(page) = code_path(self.code) {
            match stat_path(&self.full_path(page)) {
                Some(st) => {
                    self.path = page.to_string();
                    self.file_stat = Some(st);
                }
                None => self.file_stat = None,
            }
        }
    }

    fn add_state_line(&self, buff: &mut Buffer) {
        let line = format!("HTTP/1.1 {} {}\r\n", self.code, code_status(self.code));
        buff.append(line.as_bytes());
    }

    fn add_header(&self, buff: &mut Buffer) {
        buff.append(b"Connection: ");
        if self.is_keep_alive {
            buff.append(b"keep-alive\r\n");
            buff.append(b"keep-alive: max=6, timeout=120\r\n");
        } else {
            buff.append(b"close\r\n");
        }
        let content_type = format!("Content-type: {}\r\n", suffix_type(&self.path));
        buff.append(content_type.as_bytes());
    }

    fn add_content(&mut self, buff: &mut Buffer) {
        let st = match self.file_stat {
            Some(st) => st,
            None => {
                self.error_content(buff, "File NotFound!");
                return;
            }
        };
        let len = st.st_size as usize;
        match FileMap::map(&self.full_path(&self.path), len) {
            Ok(map) => {
                self.file = Some(map);
                let header = format!("Content-length: {}\r\n\r\n", len);
                buff.append(header.as_bytes());
            }
            Err(_) => self.error_content(buff, "File NotFound!"),
        }
    }

    /// Inline HTML body for error statuses with no error page on disk.
    pub fn error_content(&mut self, buff: &mut Buffer, message: &str) {
        self.unmap_file();
        let body = format!(
            "<html><title>Error</title><body bgcolor=\"ffffff\">{} : {}\n<p>{}</p><hr><em>nocturne</em></body></html>",
            self.code,
            code_status(self.code),
            message
        );
        let header = format!("Content-length: {}\r\n\r\n", body.len());
        buff.append(header.as_bytes());
        buff.append(body.as_bytes());
    }

    fn full_path(&self, path: &str) -> PathBuf {
        // Request paths always lead with '/'.
        self.src_dir.join(path.trim_start_matches('/'))
    }
}

impl Default for HttpResponse {
    fn default() -> Self {
        Self::new()
    }
}

fn stat_path(path: &Path) -> Option<libc::stat> {
    let cpath = CString::new(path.as_os_str().as_bytes()).ok()?;
    let mut st: libc::stat = unsafe { mem::zeroed() };
    let rc = unsafe { libc::stat(cpath.as_ptr(), &mut st) };
    if rc < 0 {
        return None;
    }
    Some(st)
}
