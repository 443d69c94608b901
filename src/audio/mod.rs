pub mod opus_codec;
