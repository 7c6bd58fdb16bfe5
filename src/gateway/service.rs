//! Handler operations of the transfer gateway, one per routed service.

use std::path::{Path, PathBuf};

use axum::http::{StatusCode, header};
use chrono::{TimeDelta, Utc};
use tokio::{
    fs,
    io::{self, AsyncRead, AsyncReadExt},
};

use super::{GitGateway, body::DecodedBody, routing::Operation};
use crate::{
    content::{self, condition::format_http_date},
    errors::GatewayError,
    module::{BodyReader, Input, Output},
    protocol::{RequestInfo, RpcReader, ServiceType, ToolOutputReader, packet_flush, packet_write},
};

const CACHE_FOREVER_SECS: i64 = 31_536_000;
const COPY_BUF_SIZE: usize = 32 * 1024;

/// Request context handed to an operation.
pub(crate) struct HandlerReq<'a> {
    pub input: &'a mut dyn Input,
    pub output: &'a mut dyn Output,
    pub dir: PathBuf,
    pub file: String,
}

/// Headers forbidding any caching.
pub fn hdr_nocache(output: &mut dyn Output) {
    output.set_header(header::EXPIRES, "Fri, 01 Jan 1980 00:00:00 GMT");
    output.set_header(header::PRAGMA, "no-cache");
    output.set_header(header::CACHE_CONTROL, "no-cache, max-age=0, must-revalidate");
}

/// Headers allowing a year of caching, for immutable objects and packs.
pub fn hdr_cache_forever(output: &mut dyn Output) {
    let now = Utc::now();
    output.set_header(header::DATE, &format_http_date(now));
    output.set_header(
        header::EXPIRES,
        &format_http_date(now + TimeDelta::seconds(CACHE_FOREVER_SECS)),
    );
    output.set_header(
        header::CACHE_CONTROL,
        &format!("public, max-age={CACHE_FOREVER_SECS}"),
    );
}

impl GitGateway {
    pub(crate) async fn run(
        &self,
        operation: Operation,
        hr: HandlerReq<'_>,
    ) -> Result<(), GatewayError> {
        match operation {
            Operation::ServiceRpc(service) => self.service_rpc(service, hr).await,
            Operation::InfoRefs => self.get_info_refs(hr).await,
            Operation::TextFile => {
                hdr_nocache(hr.output);
                send_file("text/plain", hr).await
            }
            Operation::InfoPacks => {
                hdr_cache_forever(hr.output);
                send_file("text/plain; charset=utf-8", hr).await
            }
            Operation::LooseObject => {
                hdr_cache_forever(hr.output);
                send_file("application/x-git-loose-object", hr).await
            }
            Operation::PackFile => {
                hdr_cache_forever(hr.output);
                send_file("application/x-git-packed-objects", hr).await
            }
            Operation::IdxFile => {
                hdr_cache_forever(hr.output);
                send_file("application/x-git-packed-objects-toc", hr).await
            }
        }
    }

    /// Whether `service` may run against `dir` for this request.
    pub(crate) async fn has_access(
        &self,
        input: &dyn Input,
        dir: &Path,
        service: ServiceType,
        check_content_type: bool,
    ) -> bool {
        if check_content_type
            && input.header("Content-Type") != Some(service.request_content_type().as_str())
        {
            return false;
        }
        let enabled = match service {
            ServiceType::UploadPack => self.config.upload_pack,
            ServiceType::ReceivePack => self.config.receive_pack,
        };
        if !enabled || !self.config.respect_repository_config {
            return enabled;
        }
        self.config_setting(dir, service).await
    }

    /// The repository's own `http.<service>` switch.
    async fn config_setting(&self, dir: &Path, service: ServiceType) -> bool {
        match self.git.config(dir, service.config_key()).await {
            Ok(setting) => {
                let setting = setting.unwrap_or_default();
                match service {
                    ServiceType::UploadPack => setting != "false",
                    ServiceType::ReceivePack => setting == "true",
                }
            }
            Err(e) => {
                tracing::debug!("treating {} as disabled: {}", service.config_key(), e);
                false
            }
        }
    }

    async fn service_rpc(
        &self,
        service: ServiceType,
        hr: HandlerReq<'_>,
    ) -> Result<(), GatewayError> {
        let HandlerReq {
            input, output, dir, ..
        } = hr;
        if !self.has_access(&*input, &dir, service, true).await {
            return Err(GatewayError::AccessDenied(dir));
        }

        let request = RequestInfo::from_input(&*input);
        let body: BodyReader = match input.take_body() {
            Some(body) => body,
            None => Box::new(io::empty()),
        };
        let mut rpc_reader = RpcReader::new(
            DecodedBody::new(body, input.header("Content-Encoding")),
            service,
        );

        output.set_header(header::CONTENT_TYPE, &service.result_content_type());
        let mut child = self
            .git
            .spawn_rpc(&dir, service, input.header("Git-Protocol"))?;
        let (Some(mut stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(GatewayError::Internal(
                "git started without piped stdio".to_string(),
            ));
        };

        let head = output.write_status(StatusCode::OK).await;
        let mut tool_output = ToolOutputReader::new(stdout);

        let reader = &mut rpc_reader;
        let feed = async move {
            let fed = io::copy(reader, &mut stdin).await;
            drop(stdin);
            match fed {
                // the tool exited without reading all of its input
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe => Ok(()),
                fed => fed.map(|_| ()),
            }
        };
        let drain = async {
            let drained = copy_to_output(&mut tool_output, &mut *output).await;
            if let Err(e) = &drained {
                // an unread tool blocks on its output pipe and stops reading its input
                tracing::debug!(rpc = %service, "killing tool after output failure: {}", e);
                let _ = child.start_kill();
            }
            drained
        };
        let (fed, drained) = tokio::join!(feed, drain);

        let tool_error = tool_output.take_error();
        drop(tool_output);
        let waited = child.wait().await;

        let copy_error = head.err().or(drained.err()).or(fed.err());
        if let Some(e) = &copy_error {
            tracing::warn!(dir = %dir.display(), rpc = %service, "rpc stream interrupted: {}", e);
            output.abort(io::Error::new(e.kind(), e.to_string())).await;
        }
        let terminal = match waited {
            Ok(status) if status.success() => None,
            Ok(status) => Some(format!("git {} exited with {}", service.rpc_name(), status)),
            Err(e) => Some(e.to_string()),
        }
        .or_else(|| tool_error.map(|e| e.to_string()))
        .or_else(|| copy_error.map(|e| e.to_string()));
        if let Some(e) = &terminal {
            tracing::warn!(dir = %dir.display(), rpc = %service, "rpc failed: {}", e);
        }

        for mut event in rpc_reader.into_events() {
            event.stamp(&dir, &request, terminal.as_deref());
            self.sink.emit(event);
        }
        Ok(())
    }

    async fn get_info_refs(&self, hr: HandlerReq<'_>) -> Result<(), GatewayError> {
        let service = hr
            .input
            .form_value("service")
            .and_then(|s| s.parse::<ServiceType>().ok());
        let access = match service {
            Some(service) => self.has_access(&*hr.input, &hr.dir, service, false).await,
            None => false,
        };

        let Some(service) = service.filter(|_| access) else {
            if let Err(e) = self.git.update_server_info(&hr.dir).await {
                tracing::warn!(dir = %hr.dir.display(), "update-server-info failed: {}", e);
            }
            hdr_nocache(hr.output);
            return send_file("text/plain; charset=utf-8", hr).await;
        };

        let refs = self
            .git
            .advertise_refs(&hr.dir, service, hr.input.header("Git-Protocol"))
            .await?;

        let output = hr.output;
        hdr_nocache(output);
        output.set_header(header::CONTENT_TYPE, &service.advertisement_content_type());
        output.write_status(StatusCode::OK).await?;
        output
            .write(&packet_write(&format!("# service={service}\n")))
            .await?;
        output.write(&packet_flush()).await?;
        output.write(&refs).await?;
        Ok(())
    }
}

/// Serves a repository file with a fixed content type.
async fn send_file(content_type: &str, hr: HandlerReq<'_>) -> Result<(), GatewayError> {
    let path = hr.dir.join(&hr.file);
    let meta = fs::metadata(&path).await?;
    if !meta.is_file() {
        return Err(GatewayError::not_found(hr.file));
    }
    hr.output.set_header(header::CONTENT_TYPE, content_type);
    content::serve_file(&*hr.input, hr.output, &path).await;
    Ok(())
}

/// Copies `reader` into the response body until EOF.
async fn copy_to_output<R>(reader: &mut R, output: &mut dyn Output) -> io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    let mut copied = 0;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(copied);
        }
        output.write(&buf[..n]).await?;
        copied += n as u64;
    }
}
