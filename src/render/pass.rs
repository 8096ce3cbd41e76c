pub mod raster;
pub mod ray_tracing;
