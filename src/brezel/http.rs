// Brezel - AHT20 temperature and humidity reporter for serial links
//
// Copyright 2022 Nick Pillitteri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//

use crate::metrics::MetricsExposition;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Body, Method, Request, Response, StatusCode};
use prometheus::TEXT_FORMAT;
use std::sync::Arc;

/// Global state shared between all HTTP requests via Arc.
pub struct RequestContext {
    exposition: MetricsExposition,
}

impl RequestContext {
    pub fn new(exposition: MetricsExposition) -> Self {
        RequestContext { exposition }
    }
}

/// Render Prometheus metrics in the text exposition format at the path `/metrics`
/// for `GET` requests. If an error is encountered, an HTTP 500 will be returned and
/// the error will be logged.
pub async fn http_route(req: Request<Body>, context: Arc<RequestContext>) -> Result<Response<Body>, hyper::Error> {
    let res = match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => match context.exposition.encoded_text() {
            Ok(buffer) => {
                tracing::debug!(message = "encoded prometheus metrics to text format");
                let mut res = Response::new(Body::from(buffer));
                res.headers_mut()
                    .insert(CONTENT_TYPE, HeaderValue::from_static(TEXT_FORMAT));
                res
            }
            Err(e) => {
                tracing::error!(message = "error encoding metrics to text format", error = %e);
                http_status_no_body(StatusCode::INTERNAL_SERVER_ERROR)
            }
        },

        (_, "/metrics") => http_status_no_body(StatusCode::METHOD_NOT_ALLOWED),

        _ => http_status_no_body(StatusCode::NOT_FOUND),
    };

    Ok(res)
}

fn http_status_no_body(code: StatusCode) -> Response<Body> {
    let mut res = Response::new(Body::empty());
    *res.status_mut() = code;
    res
}

#[cfg(test)]
mod test {
    use super::{http_route, RequestContext};
    use crate::metrics::{MetricsExposition, ReportMetrics};
    use hyper::header::CONTENT_TYPE;
    use hyper::{Body, Method, Request, StatusCode};
    use prometheus::Registry;
    use std::sync::Arc;

    fn context() -> Arc<RequestContext> {
        let reg = Registry::new();
        let _metrics = ReportMetrics::new(&reg).unwrap();
        Arc::new(RequestContext::new(MetricsExposition::new(reg)))
    }

    fn request(method: Method, path: &str) -> Request<Body> {
        Request::builder().method(method).uri(path).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_get_metrics() {
        let res = http_route(request(Method::GET, "/metrics"), context()).await.unwrap();

        assert_eq!(StatusCode::OK, res.status());
        assert_eq!(prometheus::TEXT_FORMAT, res.headers()[CONTENT_TYPE]);

        let body = hyper::body::to_bytes(res.into_body()).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("brezel_collections_total 0"));
    }

    #[tokio::test]
    async fn test_post_metrics_not_allowed() {
        let res = http_route(request(Method::POST, "/metrics"), context()).await.unwrap();
        assert_eq!(StatusCode::METHOD_NOT_ALLOWED, res.status());
    }

    #[tokio::test]
    async fn test_unknown_path() {
        let res = http_route(request(Method::GET, "/"), context()).await.unwrap();
        assert_eq!(StatusCode::NOT_FOUND, res.status());
    }
}
