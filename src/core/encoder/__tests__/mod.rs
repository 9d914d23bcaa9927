mod encoder_test;
