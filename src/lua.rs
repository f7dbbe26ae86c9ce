mod codegen;
mod convert;
mod runtime;
mod sandbox;

pub use codegen::generate;
pub use runtime::LuaEvaluator;
