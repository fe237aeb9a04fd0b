fn main() -> libtlink::error::Result {
    let args = libtlink::args::Args::from_env()?;
    libtlink::timing::init_tracing();
    libtlink::link(&args)
}
