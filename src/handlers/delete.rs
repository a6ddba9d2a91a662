//! The DELETE pipeline: unlink a file or remove an empty directory.

use super::{error_response, resolve_path, Handler, ResolvedPath};
use crate::config::ServerConfig;
use crate::request::{Method, Request};
use crate::response::Response;
use crate::status;
use camino::Utf8Path;
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;

pub struct DeletePipeline<'a> {
    server: &'a ServerConfig,
    request: &'a Request,
    route: Option<&'a str>,
    storage_size: &'a mut u64,
}

impl<'a> DeletePipeline<'a> {
    pub fn new(
        server: &'a ServerConfig,
        request: &'a Request,
        route: Option<&'a str>,
        storage_size: &'a mut u64,
    ) -> Self {
        Self {
            server,
            request,
            route,
            storage_size,
        }
    }

    fn fail(&self, code: u16) -> Response {
        error_response(self.server, self.route, code)
    }

    fn delete_file(&mut self, path: &Utf8Path, metadata: &fs::Metadata) -> u16 {
        if metadata.permissions().mode() & 0o200 == 0 {
            return status::FORBIDDEN;
        }

        let size = metadata.len();
        match fs::remove_file(path) {
            Ok(()) => {
                *self.storage_size = self.storage_size.saturating_sub(size);
                status::OK
            }
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => status::FORBIDDEN,
            Err(_) => status::INTERNAL_SERVER_ERROR,
        }
    }

    fn delete_directory(&self, path: &Utf8Path) -> u16 {
        match dir_is_empty(path) {
            Ok(true) => {}
            Ok(false) => return status::CONFLICT,
            Err(_) => return status::INTERNAL_SERVER_ERROR,
        }
        match fs::remove_dir(path) {
            Ok(()) => status::OK,
            Err(_) => status::INTERNAL_SERVER_ERROR,
        }
    }
}

impl Handler for DeletePipeline<'_> {
    fn run(mut self) -> Response {
        if !self.server.methods_for(self.route).contains(&Method::Delete) {
            return self.fail(status::METHOD_NOT_ALLOWED);
        }

        let path = match resolve_path(self.server, self.route, &self.request.decoded_uri) {
            ResolvedPath::Found(path) => path,
            ResolvedPath::NotFound => return self.fail(status::NOT_FOUND),
            ResolvedPath::Escapes => return self.fail(status::FORBIDDEN),
        };
        let metadata = match path.metadata() {
            Ok(m) => m,
            Err(_) => return self.fail(status::NOT_FOUND),
        };

        let outcome = if metadata.is_dir() {
            self.delete_directory(&path)
        } else {
            self.delete_file(&path, &metadata)
        };

        if outcome != status::OK {
            return self.fail(outcome);
        }

        log::info!(path = path.as_str(); "deleted");
        Response::new(status::NO_CONTENT).with_common_headers()
    }
}

fn dir_is_empty(path: &Utf8Path) -> io::Result<bool> {
    Ok(path.read_dir_utf8()?.next().is_none())
}
