mod files;

use crate::handlers::ServeContext;
use warp::Filter;

pub fn routes(
    ctx: ServeContext,
) -> impl warp::Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    files::favicon().or(files::serve(ctx))
}
