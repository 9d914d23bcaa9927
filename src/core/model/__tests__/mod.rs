mod autoencoder_test;
mod composer_test;
