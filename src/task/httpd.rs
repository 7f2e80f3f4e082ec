//! HTTP servers: the captive portal on the setup network and the front-end
//! on the home network.
use alloc::{borrow::Cow, boxed::Box, format, string::String};
use core::net::{Ipv4Addr, SocketAddrV4};
use edge_http::io::{
    Error,
    server::{Connection, Handler, Server},
};
use edge_nal::TcpBind;
use edge_nal_embassy::{Tcp, TcpBuffers};
use embassy_sync::{blocking_mutex::raw::NoopRawMutex, mutex::Mutex, signal::Signal};
use embedded_io_async::{Read, Write};
use hbfc_core::{
    Event,
    event::{ApMode, Web},
    fan::FanStatus,
    humidity::{DEFAULT_THRESHOLD, Reading},
    portal::parse_credentials_form,
};
use serde::Serialize;

use crate::{
    bus::SharedBus,
    memlog::SharedLogger,
    storage::SharedCredentials,
    task::{
        config_link::LinkStatusDynReceiver,
        control::{ControlStatus, ControlStatusDynReceiver},
        fan::{FanStatusDynReceiver, SharedRegulator},
        humidity_sensor::{HumidityDynReceiver, ThresholdDynReceiver, ThresholdDynSender},
        peer::ExteriorHumidityDynReceiver,
    },
};

const HTTPD_LISTEN_ADDR: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::new(0, 0, 0, 0), 80);

const HTTPD_MOTD: &str =
    const_format::formatcp!("{} {}\n", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));

// How many concurrent connections we can accept.
const HTTPD_HANDLERS: usize = 2;
const HTTPD_BUF_SIZE: usize = 1024;
const HTTPD_MAX_HEADERS_COUNT: usize = 32;
// A percent-encoded form with both fields at their longest.
const PORTAL_BODY_SIZE: usize = 320;

/// Raised once the nodes are paired.
pub type FrontEndSignal = &'static Signal<NoopRawMutex, ()>;

pub fn init_front_end() -> FrontEndSignal {
    Box::leak(Box::new(Signal::new()))
}

type Response = Result<(&'static str, Cow<'static, str>), (u16, &'static str, Option<&'static str>)>;

const TEXT: &str = "text/plain";
const HTML: &str = "text/html";
const JSON: &str = "application/json";

//
// Captive portal.
//

const FORM_PAGE: &str = "<html>\
<head><title>HBFC/D Wireless Setup</title></head>\
<body>\
<h1>Humidity Based Fan Controller / Dehumidifier</h1>\
<p>The controller could not join its saved network. Enter the network to use.</p>\
<form action=\"./submit\" method=\"post\">\
SSID:<br><input type=\"text\" name=\"ssid\"><br>\
Password:<br><input type=\"password\" name=\"pass\"><br><br>\
<input type=\"submit\" value=\"Submit\">\
</form>\
</body>\
</html>";

const WAIT_PAGE: &str = "<html>\
<head><title>HBFC/D Wait</title></head>\
<body>\
<h1>Humidity Based Fan Controller / Dehumidifier</h1>\
<p>The exterior sensor has not connected yet. Wait a few seconds and reload this page.</p>\
</body>\
</html>";

const SUBMIT_PAGE: &str = "<html>\
<head><title>HBFC/D Setup Saved</title></head>\
<body>\
<p>Network saved. Both units will now try to join it.</p>\
</body>\
</html>";

/// Serves the portal on the setup network for the node's whole life.
#[embassy_executor::task]
pub async fn portal(
    stack: embassy_net::Stack<'static>,
    link_status: LinkStatusDynReceiver,
    credentials: SharedCredentials,
    bus: SharedBus,
    memlog: SharedLogger,
) {
    let handler = PortalHandler {
        link_status: Mutex::new(link_status),
        credentials,
        bus,
        memlog,
    };
    if let Err(error) = serve(stack, handler).await {
        memlog.error(format!("portal: {error}"));
        bus.report(Event::ApMode(ApMode::WebInitFailure));
    }
}

struct PortalHandler {
    link_status: Mutex<NoopRawMutex, LinkStatusDynReceiver>,
    credentials: SharedCredentials,
    bus: SharedBus,
    memlog: SharedLogger,
}

impl Handler for PortalHandler {
    type Error<E>
        = Error<E>
    where
        E: core::fmt::Debug;

    async fn handle<T, const N: usize>(
        &self,
        _task_id: impl core::fmt::Display + Copy,
        connection: &mut Connection<'_, T, N>,
    ) -> Result<(), Self::Error<T::Error>>
    where
        T: Read + Write,
    {
        let headers = connection.headers()?;
        let method = headers.method;
        let submit = headers.path.trim_start_matches(['/', '.']).starts_with("submit");

        use edge_http::Method::{Get, Post};
        let response: Response = match (method, submit) {
            // POST ./submit
            (Post, true) => {
                let mut body = [0u8; PORTAL_BODY_SIZE];
                let mut len = 0;
                while len < body.len() {
                    let read = connection.read(&mut body[len..]).await?;
                    if read == 0 {
                        break;
                    }
                    len += read;
                }
                self.save(&body[..len])
            }

            // Operating systems check all sorts of paths; every one gets the portal.
            (Get, _) => {
                let linked = self.link_status.lock().await.try_get().unwrap_or(false);
                Ok((HTML, if linked { FORM_PAGE } else { WAIT_PAGE }.into()))
            }

            (Post, false) => Err((404, "Not Found", None)),
            _ => Err((405, "Method Not Allowed", None)),
        };

        respond(connection, response).await
    }
}

impl PortalHandler {
    fn save(&self, body: &[u8]) -> Response {
        let submitted = match parse_credentials_form(body) {
            Ok(submitted) => submitted,
            Err(error) => {
                self.memlog.warn(format!("portal: {error}"));
                return Err((400, "Bad Request", Some("An SSID is required\n")));
            }
        };
        if let Err(error) = self.credentials.store(&submitted) {
            self.memlog.error(format!("portal: saving credentials: {error}"));
            self.bus.report(Event::ApMode(ApMode::FlashFailure));
            return Err((500, "Internal Server Error", None));
        }

        self.memlog.info(format!(
            "portal: saved credentials for '{}'",
            String::from_utf8_lossy(submitted.ssid())
        ));
        self.bus.report(Event::ApMode(ApMode::ConfigRecv));
        Ok((HTML, SUBMIT_PAGE.into()))
    }
}

//
// Front-end.
//

pub struct FrontEndLinks {
    pub control_status: ControlStatusDynReceiver,
    pub interior_humidity: HumidityDynReceiver,
    pub exterior_humidity: ExteriorHumidityDynReceiver,
    pub fan_status: FanStatusDynReceiver,
    pub threshold_sender: ThresholdDynSender,
    pub threshold_receiver: ThresholdDynReceiver,
    pub regulator: SharedRegulator,
}

/// Waits until the nodes are paired, then serves the front-end on the home network.
#[embassy_executor::task]
pub async fn front_end(
    stack: embassy_net::Stack<'static>,
    start: FrontEndSignal,
    links: FrontEndLinks,
    bus: SharedBus,
    memlog: SharedLogger,
) {
    start.wait().await;
    memlog.info("httpd: front-end up");

    let handler = FrontEndHandler {
        links: Mutex::new(links),
        bus,
        memlog,
    };
    if let Err(error) = serve(stack, handler).await {
        memlog.error(format!("httpd: {error}"));
        bus.report(Event::Web(Web::InitFailure));
    }
}

struct FrontEndHandler {
    links: Mutex<NoopRawMutex, FrontEndLinks>,
    bus: SharedBus,
    memlog: SharedLogger,
}

#[derive(Serialize)]
struct StatusDocument {
    control: Option<ControlStatus>,
    interior: Option<Reading>,
    exterior: Option<f32>,
    threshold: f32,
    fan: Option<FanStatus>,
}

impl Handler for FrontEndHandler {
    type Error<E>
        = Error<E>
    where
        E: core::fmt::Debug;

    async fn handle<T, const N: usize>(
        &self,
        _task_id: impl core::fmt::Display + Copy,
        connection: &mut Connection<'_, T, N>,
    ) -> Result<(), Self::Error<T::Error>>
    where
        T: Read + Write,
    {
        let headers = connection.headers()?;

        // Parse path segments.
        let mut segments = headers.path.split('/').skip(1).take(2);

        use edge_http::Method::Get;
        let response: Response = match (headers.method, segments.next(), segments.next()) {
            // GET /
            (Get, Some(""), None) => Ok((TEXT, HTTPD_MOTD.into())),

            // GET /help
            (Get, Some("help"), None) => {
                let content = "\
                     GET /status\n\
                     GET /events\n\
                     GET /target\n\
                     GET /target/<rpm>\n\
                     GET /threshold\n\
                     GET /threshold/<rh>\n\
                     GET /log\n\
                     GET /log/clear\n\
                     GET /help\n\
                     ";
                Ok((TEXT, content.into()))
            }

            // GET /status
            (Get, Some("status"), None) => {
                let mut links = self.links.lock().await;
                let document = StatusDocument {
                    control: links.control_status.try_get(),
                    interior: links.interior_humidity.try_get(),
                    exterior: links.exterior_humidity.try_get(),
                    threshold: links.threshold_receiver.try_get().unwrap_or(DEFAULT_THRESHOLD),
                    fan: links.fan_status.try_get(),
                };
                match serde_json::to_string(&document) {
                    Ok(json) => Ok((JSON, json.into())),
                    Err(_) => Err((500, "Internal Server Error", None)),
                }
            }

            // GET /events
            (Get, Some("events"), None) => {
                let content = self
                    .bus
                    .history()
                    .iter()
                    .map(|(priority, event)| format!("{priority:?} {event}\n"))
                    .collect::<String>();
                Ok((TEXT, content.into()))
            }

            // GET /target
            (Get, Some("target"), None) => {
                let target = self.links.lock().await.regulator.lock(|r| r.borrow().target());
                Ok((TEXT, format!("{target}\n").into()))
            }

            // GET /target/<rpm>
            (Get, Some("target"), Some(rpm)) => match rpm.parse::<u32>() {
                Err(_) => Err((400, "Bad Request", None)),
                Ok(rpm) => {
                    let regulator = self.links.lock().await.regulator;
                    match crate::task::fan::set_target(regulator, rpm) {
                        Ok(()) => {
                            self.memlog.info(format!("httpd: fan target set to {rpm} rpm"));
                            Ok((TEXT, format!("Fan target set to {rpm} rpm\n").into()))
                        }
                        Err(_) => Err((
                            400,
                            "Bad Request",
                            Some("Fan target must be in the [300,3100] range\n"),
                        )),
                    }
                }
            },

            // GET /threshold
            (Get, Some("threshold"), None) => {
                let threshold = self
                    .links
                    .lock()
                    .await
                    .threshold_receiver
                    .try_get()
                    .unwrap_or(DEFAULT_THRESHOLD);
                Ok((TEXT, format!("{threshold:.1}\n").into()))
            }

            // GET /threshold/<rh>
            (Get, Some("threshold"), Some(rh)) => match rh.parse::<u8>() {
                Ok(rh) if rh <= 100 => {
                    self.links.lock().await.threshold_sender.send(f32::from(rh));
                    self.memlog.info(format!("httpd: humidity threshold set to {rh}%"));
                    Ok((TEXT, format!("Humidity threshold set to {rh}%\n").into()))
                }
                _ => Err((
                    400,
                    "Bad Request",
                    Some("Humidity threshold must be in the [0,100] range\n"),
                )),
            },

            // GET /log
            (Get, Some("log"), None) => Ok((TEXT, self.memlog.render("\n").into())),

            // GET /log/clear
            (Get, Some("log"), Some("clear")) => {
                self.memlog.clear();
                Ok((TEXT, "Logs cleared\n".into()))
            }

            // GET not found
            (Get, _, _) => Err((404, "Not Found", None)),

            //
            // Unsupported methods.
            //
            _ => Err((405, "Method Not Allowed", None)),
        };

        respond(connection, response).await
    }
}

#[derive(Debug, thiserror::Error)]
enum ServeError {
    #[error("bind failed: {0:?}")]
    Bind(edge_nal_embassy::TcpError),
    #[error("server stopped: {0}")]
    Run(String),
}

async fn serve(stack: embassy_net::Stack<'static>, handler: impl Handler) -> Result<(), ServeError> {
    let buffers = TcpBuffers::<HTTPD_HANDLERS, HTTPD_BUF_SIZE, HTTPD_BUF_SIZE>::new();
    let tcp = Tcp::new(stack, &buffers);
    let acceptor = tcp
        .bind(HTTPD_LISTEN_ADDR.into())
        .await
        .map_err(ServeError::Bind)?;

    let mut server = Server::<HTTPD_HANDLERS, HTTPD_BUF_SIZE, HTTPD_MAX_HEADERS_COUNT>::new();
    server
        .run(None, acceptor, handler)
        .await
        .map_err(|error| ServeError::Run(format!("{error:?}")))
}

async fn respond<T, const N: usize>(
    connection: &mut Connection<'_, T, N>,
    response: Response,
) -> Result<(), Error<T::Error>>
where
    T: Read + Write,
{
    match response {
        Ok((content_type, content)) => {
            connection
                .initiate_response(200, Some("OK"), &[("Content-Type", content_type)])
                .await?;
            connection.write_all(content.as_bytes()).await
        }
        Err((code, message, content)) => {
            // If we have content for the error response:
            // (1) set the content type,
            // (2) write the content message.
            let content_type: &[(&str, &str)] = if content.is_none() {
                &[]
            } else {
                &[("Content-Type", TEXT)]
            };

            connection
                .initiate_response(code, Some(message), content_type)
                .await?;

            if let Some(content) = content {
                connection.write_all(content.as_bytes()).await?;
            }
            Ok(())
        }
    }
}
