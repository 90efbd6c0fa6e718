pub mod bytes_codec;

/// Define a codec type and implement the Codec trait
pub trait Codec {
    fn codec_name<T>(&self) -> String;
}
