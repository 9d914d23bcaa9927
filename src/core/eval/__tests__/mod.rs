mod loglikelihood_test;
