use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use pin_project_lite::pin_project;
use tower::{util::Oneshot, ServiceExt};

/// Adapts a Tower service, such as an `axum::Router`, so that it can be served by [`HttpServer`][crate::net::server::http::HttpServer].
///
/// Hyper services take `&self` and have no readiness step, so each request is handled by a fresh clone of the Tower
/// service that is driven to readiness before being called.
#[derive(Debug, Copy, Clone)]
pub struct TowerToHyperService<S> {
    service: S,
}

impl<S> TowerToHyperService<S> {
    /// Create a new `TowerToHyperService` wrapping the given Tower service.
    pub fn new(tower_service: S) -> Self {
        Self { service: tower_service }
    }
}

impl<S, R> hyper::service::Service<R> for TowerToHyperService<S>
where
    S: tower::Service<R> + Clone,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = TowerToHyperServiceFuture<S, R>;

    fn call(&self, req: R) -> Self::Future {
        TowerToHyperServiceFuture {
            future: self.service.clone().oneshot(req),
        }
    }
}

pin_project! {
    /// Response future for [`TowerToHyperService`].
    pub struct TowerToHyperServiceFuture<S, R>
    where
        S: tower::Service<R>,
    {
        #[pin]
        future: Oneshot<S, R>,
    }
}

impl<S, R> Future for TowerToHyperServiceFuture<S, R>
where
    S: tower::Service<R>,
{
    type Output = Result<S::Response, S::Error>;

    #[inline]
    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.project().future.poll(cx)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        convert::Infallible,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
    };

    use hyper::service::Service as _;

    use super::*;

    #[tokio::test]
    async fn each_call_uses_a_ready_clone() {
        let calls = Arc::new(AtomicUsize::new(0));
        let tower_service = {
            let calls = Arc::clone(&calls);
            tower::service_fn(move |req: u32| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, Infallible>(req * 2)
                }
            })
        };

        let service = TowerToHyperService::new(tower_service);
        assert_eq!(service.call(2).await.unwrap(), 4);
        assert_eq!(service.call(21).await.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
