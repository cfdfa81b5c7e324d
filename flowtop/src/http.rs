use std::{
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use actix::{Actor, ActorContext, AsyncContext, StreamHandler};
use actix_web::{
    App, Error, HttpRequest, HttpResponse, HttpServer, dev::Server, middleware, web,
};
use actix_web_actors::ws;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    error::MonitorError,
    snapshot::FlowSnapshot,
    stats::{Iface, IfaceSummary, Stats},
};

const HTTP_WORKERS: usize = 2;
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(10);
// polled faster than the sampler so pushes follow ticks closely
const PUSH_POLL_INTERVAL: Duration = Duration::from_millis(200);

const INDEX_HTML: &str = include_str!("../static/index.html");

pub fn serve(stats: Arc<Stats>, listen: SocketAddr) -> Result<Server> {
    let data = web::Data::from(stats);
    let server = HttpServer::new(move || {
        App::new()
            .app_data(data.clone())
            .wrap(middleware::Logger::default())
            .configure(routes)
    })
    .workers(HTTP_WORKERS)
    .disable_signals()
    .bind(listen)
    .with_context(|| format!("failed to bind HTTP server on {listen}"))?
    .run();
    Ok(server)
}

pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/", web::get().to(index))
        .route("/l3flow", web::get().to(l3_flows))
        .route("/l4flow", web::get().to(l4_flows))
        .route("/ifaces", web::get().to(ifaces))
        .route("/ws", web::get().to(ws_index));
}

#[derive(Debug, Default, Deserialize)]
pub struct IfaceQuery {
    iface: Option<String>,
}

#[derive(Clone, Copy)]
enum Layer {
    L3,
    L4,
}

async fn index() -> HttpResponse {
    HttpResponse::Ok()
        .content_type("text/html; charset=utf-8")
        .body(INDEX_HTML)
}

async fn l3_flows(stats: web::Data<Stats>, query: web::Query<IfaceQuery>) -> HttpResponse {
    flows_response(&stats, query.iface.as_deref(), Layer::L3)
}

async fn l4_flows(stats: web::Data<Stats>, query: web::Query<IfaceQuery>) -> HttpResponse {
    flows_response(&stats, query.iface.as_deref(), Layer::L4)
}

async fn ifaces(stats: web::Data<Stats>) -> HttpResponse {
    let summaries: Vec<IfaceSummary> = stats.iter().map(|iface| iface.summary()).collect();
    json_response(&summaries)
}

fn flows_response(stats: &Stats, name: Option<&str>, layer: Layer) -> HttpResponse {
    let iface = match stats.resolve(name) {
        Ok(iface) => iface,
        Err(err) => return HttpResponse::NotFound().body(err.to_string()),
    };
    let flows = match layer {
        Layer::L3 => iface.l3_snapshots(),
        Layer::L4 => iface.l4_snapshots(),
    };
    json_response(&*flows)
}

fn json_response<T: Serialize + ?Sized>(value: &T) -> HttpResponse {
    match serde_json::to_vec(value) {
        Ok(body) => HttpResponse::Ok()
            .content_type("application/json")
            .body(body),
        Err(err) => {
            let err = MonitorError::from(err);
            warn!(%err, "snapshot encoding failed");
            HttpResponse::InternalServerError().body(err.to_string())
        }
    }
}

pub async fn ws_index(
    r: HttpRequest,
    stream: web::Payload,
    stats: web::Data<Stats>,
    query: web::Query<IfaceQuery>,
) -> Result<HttpResponse, Error> {
    let iface = match stats.resolve(query.iface.as_deref()) {
        Ok(iface) => iface.clone(),
        Err(err) => return Ok(HttpResponse::NotFound().body(err.to_string())),
    };
    ws::start(FlowSocket::new(iface), &r, stream)
}

#[derive(Serialize)]
struct FlowUpdate<'a> {
    iface: &'a str,
    l3: &'a [FlowSnapshot],
    l4: &'a [FlowSnapshot],
}

/// Pushes every newly published snapshot pair to the client.
struct FlowSocket {
    hb: Instant,
    iface: Arc<Iface>,
    last_generation: u64,
}

impl Actor for FlowSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        self.hb(ctx);
        self.push(ctx);
        ctx.run_interval(PUSH_POLL_INTERVAL, |act, ctx| act.push(ctx));
    }
}

impl FlowSocket {
    fn new(iface: Arc<Iface>) -> Self {
        Self {
            hb: Instant::now(),
            iface,
            last_generation: 0,
        }
    }

    fn hb(&self, ctx: &mut <Self as Actor>::Context) {
        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.hb) > CLIENT_TIMEOUT {
                debug!(iface = %act.iface.name(), "websocket client timed out");
                ctx.stop();
                return;
            }

            ctx.ping(b"");
        });
    }

    fn push(&mut self, ctx: &mut <Self as Actor>::Context) {
        let published = self.iface.published();
        if published.generation == self.last_generation {
            return;
        }
        self.last_generation = published.generation;

        let update = FlowUpdate {
            iface: self.iface.name(),
            l3: &published.l3,
            l4: &published.l4,
        };
        match serde_json::to_string(&update) {
            Ok(text) => ctx.text(text),
            Err(err) => warn!(%err, "failed to encode websocket update"),
        }
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for FlowSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Ping(msg)) => {
                self.hb = Instant::now();
                ctx.pong(&msg);
            }
            Ok(ws::Message::Pong(_)) => {
                self.hb = Instant::now();
            }
            // any client message counts as liveness
            Ok(ws::Message::Text(_)) | Ok(ws::Message::Binary(_)) => {
                self.hb = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) | Ok(ws::Message::Nop) => {}
            Err(err) => {
                debug!(%err, "websocket protocol error");
                ctx.stop();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::IfaceOptions;
    use actix_web::{http::StatusCode, rt::time::timeout, test, web::Bytes};
    use awc::ws::{Frame, Message};
    use flowtop_common::{
        DecodedFrame, Direction, NetworkLayer, NetworkProtocol, TransportLayer, TransportProtocol,
    };
    use futures_util::{SinkExt as _, StreamExt as _};
    use serde_json::Value;

    fn eth0() -> Iface {
        Iface::new(
            "eth0",
            IfaceOptions {
                enable_l4: true,
                ..Default::default()
            },
        )
    }

    fn upload_second(iface: &Iface) {
        iface.ingest(&DecodedFrame {
            timestamp_ms: 0,
            wire_len: 125_000,
            network: Some(NetworkLayer {
                protocol: NetworkProtocol::Ipv4,
                src: [10, 0, 0, 1].into(),
                dst: [93, 184, 216, 34].into(),
            }),
            transport: Some(TransportLayer {
                protocol: TransportProtocol::Tcp,
                src_port: 5000,
                dst_port: 443,
            }),
            direction: Direction::Upload,
        });
    }

    fn stats_with_traffic() -> Arc<Stats> {
        let iface = eth0();
        upload_second(&iface);
        iface.tick(1_000);
        Arc::new(Stats::new([iface]))
    }

    fn test_server(stats: Arc<Stats>) -> actix_test::TestServer {
        let data = web::Data::from(stats);
        actix_test::start(move || App::new().app_data(data.clone()).configure(routes))
    }

    #[actix_web::test]
    async fn l4flow_serves_ranked_json() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::from(stats_with_traffic()))
                .configure(routes),
        )
        .await;
        let req = test::TestRequest::get().uri("/l4flow").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        let flows = body.as_array().expect("array");
        assert_eq!(flows.len(), 1);
        assert_eq!(flows[0]["Protocol"], "TCP");
        assert_eq!(flows[0]["SourceAddress"], "10.0.0.1:5000");
        assert_eq!(flows[0]["DestinationAddress"], "93.184.216.34:443");
        assert_eq!(flows[0]["UpStreamRate1"], 1_000_000);
        assert_eq!(flows[0]["UpStreamRate15"], 0);
    }

    #[actix_web::test]
    async fn unknown_iface_is_not_found() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::from(stats_with_traffic()))
                .configure(routes),
        )
        .await;
        let req = test::TestRequest::get()
            .uri("/l3flow?iface=wlan9")
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[actix_web::test]
    async fn ifaces_reports_counters() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::from(stats_with_traffic()))
                .configure(routes),
        )
        .await;
        let req = test::TestRequest::get().uri("/ifaces").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body[0]["name"], "eth0");
        assert_eq!(body[0]["frames"], 1);
        assert_eq!(body[0]["l4_flows"], 1);
    }

    #[actix_web::test]
    async fn index_serves_the_live_page() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::from(stats_with_traffic()))
                .configure(routes),
        )
        .await;
        let req = test::TestRequest::get().uri("/").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = test::read_body(resp).await;
        let page = std::str::from_utf8(&body).unwrap();
        assert!(page.contains("/ws"));
    }

    #[actix_web::test]
    async fn websocket_pushes_each_published_tick() {
        let stats = Arc::new(Stats::new([eth0()]));
        let mut srv = test_server(stats.clone());
        let mut socket = srv.ws_at("/ws").await.unwrap();

        let iface = stats.get("eth0").unwrap();
        upload_second(iface);
        iface.tick(1_000);

        let frame = timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("update within the poll interval")
            .unwrap()
            .unwrap();
        let Frame::Text(text) = frame else {
            panic!("expected a text frame, got {frame:?}");
        };
        let update: Value = serde_json::from_slice(&text).unwrap();
        assert_eq!(update["iface"], "eth0");
        assert_eq!(update["l3"][0]["UpStreamRate1"], 1_000_000);
        assert_eq!(update["l4"][0]["UpStreamRate1"], 1_000_000);
        assert_eq!(update["l4"][0]["SourceAddress"], "10.0.0.1:5000");

        // no new tick, no new message
        assert!(
            timeout(Duration::from_millis(600), socket.next())
                .await
                .is_err()
        );
    }

    #[actix_web::test]
    async fn websocket_answers_pings() {
        let mut srv = test_server(Arc::new(Stats::new([eth0()])));
        let mut socket = srv.ws_at("/ws?iface=eth0").await.unwrap();

        socket
            .send(Message::Ping(Bytes::from_static(b"alive")))
            .await
            .unwrap();
        let frame = timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("pong")
            .unwrap()
            .unwrap();
        assert_eq!(frame, Frame::Pong(Bytes::from_static(b"alive")));
    }

    #[actix_web::test]
    async fn websocket_for_unknown_iface_is_not_found() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::from(stats_with_traffic()))
                .configure(routes),
        )
        .await;
        let req = test::TestRequest::get().uri("/ws?iface=wlan9").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
