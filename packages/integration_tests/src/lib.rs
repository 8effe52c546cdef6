#[cfg(test)]
mod satellite;

mod arq;
mod multiplexer;
