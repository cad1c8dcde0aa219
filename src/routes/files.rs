use crate::handlers::{self, ServeContext};
use warp::Filter;

pub(super) fn favicon() -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone
{
    warp::path!("favicon.ico")
        .and(warp::get().or(warp::head()).unify())
        .map(handlers::favicon)
}

fn with_context(
    ctx: ServeContext,
) -> impl Filter<Extract = (ServeContext,), Error = std::convert::Infallible> + Clone {
    warp::any().map(move || ctx.clone())
}

/// Catch-all: every other path and method ends up here and is resolved
/// against the current snapshot.
pub(super) fn serve(
    ctx: ServeContext,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    with_context(ctx)
        .and(warp::path::full())
        .and(warp::method())
        .and(warp::header::optional::<String>("range"))
        .and_then(handlers::serve_path)
}
